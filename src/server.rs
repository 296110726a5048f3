use crate::{
    args,
    callbacks::CallbackRouter,
    config::ServerConfig,
    dispatcher::{panic_message, DispatchError, Dispatcher, HandlerError, RpcFunctionInfo},
    frame::{ConnectionId, ResponseFrame, STATUS_ERROR, STATUS_OK},
    handles::{HandleRegistry, Timer},
    net::server::{self as transport, ConnectionManager},
    queue::{self, DispatchTask, Task, TaskReceiver, TaskSender},
    types::{Arguments, Args, Encode, Typed},
    AllocateCallback, RpcFunction,
};
use std::{
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::{runtime, sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// The host side of the bridge.
///
/// Network I/O runs on background tasks; registered functions run only
/// inside [`process_pending`](Self::process_pending) or
/// [`wait_for_all_connections`](Self::wait_for_all_connections), on whatever
/// thread calls them.
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    handles: HandleRegistry,
    callbacks: CallbackRouter,
    connections: ConnectionManager,
    tasks: TaskSender,
    queue: TaskReceiver,
    runtime: runtime::Handle,
    shutdown: ShutdownHandle,
    acceptor: JoinHandle<()>,
}

impl Server {
    /// Binds the listener and starts accepting connections in the background.
    /// `_RPC::AllocateCallback` is registered before the first accept.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = transport::bind(&config).await?;
        let local_addr = listener.local_addr()?;

        let connections = ConnectionManager::new();
        let callbacks = CallbackRouter::new(connections.clone());
        let (tasks, queue) = queue::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = transport::spawn_acceptor(
            listener,
            config.clone(),
            connections.clone(),
            tasks.clone(),
            shutdown_rx,
        );

        let mut dispatcher = Dispatcher::default();
        dispatcher.add(AllocateCallback);

        Ok(Self {
            config,
            local_addr,
            dispatcher,
            handles: HandleRegistry::new(),
            callbacks,
            connections,
            tasks,
            queue,
            runtime: runtime::Handle::current(),
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers `rpc_function` under its own name, replacing any previous
    /// function of that name.
    pub fn register<RFn>(&mut self, rpc_function: RFn)
    where
        RFn: RpcFunction + Send + 'static,
    {
        self.dispatcher.add(rpc_function);
    }

    /// Registers a closure. Parameter types come from the closure's tuple
    /// argument; `params` names them in order.
    ///
    /// ```no_run
    /// # async fn demo() -> std::io::Result<()> {
    /// use rpcbridge::{Server, ServerConfig};
    ///
    /// let mut server = Server::bind(ServerConfig::default()).await?;
    /// server.register_fn("add", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a + b));
    /// # Ok(())
    /// # }
    /// ```
    pub fn register_fn<F, D, R>(&mut self, name: &str, params: &[&str], f: F)
    where
        F: Fn(&mut Context<'_>, D) -> Result<R, HandlerError> + Send + 'static,
        D: Arguments + 'static,
        R: Encode + Typed + 'static,
    {
        self.dispatcher.add_fn(name, params, f);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.dispatcher.contains(name)
    }

    pub fn functions(&self) -> Vec<RpcFunctionInfo> {
        self.dispatcher.rpc_functions()
    }

    /// Pushes a CALLBACK frame to the connection owning `callback_id`.
    /// Unknown ids and departed connections are ignored.
    pub fn trigger_callback(&self, callback_id: i32, args: &Args) -> bool {
        self.callbacks.trigger(callback_id, args)
    }

    /// A shareable router for triggering callbacks from other threads.
    pub fn callbacks(&self) -> CallbackRouter {
        self.callbacks.clone()
    }

    pub fn handles(&mut self) -> &mut HandleRegistry {
        &mut self.handles
    }

    pub fn live_connections(&self) -> usize {
        self.connections.live_count()
    }

    /// Tasks waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Runs queued work until the queue is empty and returns how many tasks
    /// ran. Call this at the host's cadence, e.g. once per frame.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Some(task) = self.queue.try_next() {
            self.execute_guarded(task);
            processed += 1;
        }
        processed
    }

    /// Serves forever on the calling task, for hosts without a loop of their
    /// own. Returns once [`ShutdownHandle::shutdown`] is called.
    pub async fn wait_for_all_connections(&mut self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let task = tokio::select! {
                task = self.queue.next() => task,
                _ = shutdown.wait_for(|stopped| *stopped) => None,
            };
            match task {
                Some(task) => {
                    self.execute_guarded(task);
                    self.process_pending();
                }
                None => break,
            }
        }
        info!("stopped serving");
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stops accepting and closes every live connection.
    pub fn shutdown(&mut self) {
        self.shutdown.shutdown();
        self.acceptor.abort();
        self.connections.close_all();
    }

    fn execute_guarded(&mut self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.execute(task))) {
            error!("dispatch task failed: {}", panic_message(payload));
        }
    }

    fn execute(&mut self, task: Task) {
        match task {
            Task::Call(call) => self.respond(call),
            Task::Trigger { callback_id, args } => {
                self.callbacks.trigger(callback_id, &args);
            }
        }
    }

    fn respond(&mut self, task: DispatchTask) {
        let DispatchTask {
            connection,
            request_id,
            function,
            payload,
        } = task;

        let outcome = match args::decode_args(&payload) {
            Ok(args) => {
                let mut cx = Context::new(
                    connection,
                    &mut self.handles,
                    &self.callbacks,
                    &self.tasks,
                    &self.runtime,
                );
                self.dispatcher.call(&function, &args, &mut cx)
            }
            Err(err) => Err(DispatchError::MalformedArguments(err.to_string())),
        };

        let (status, payload) = match outcome {
            Ok(value) => {
                debug!(connection, request_id, function = %function, "call succeeded");
                (STATUS_OK, args::encode_result(&value))
            }
            Err(err) => {
                warn!(connection, request_id, function = %function, "call failed: {err}");
                (STATUS_ERROR, args::encode_error(err.kind(), &err.to_string()))
            }
        };

        let frame = payload
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                ResponseFrame::returning(connection, status, payload).map_err(|err| err.to_string())
            })
            .or_else(|err| {
                error!(connection, function = %function, "could not encode response: {err}");
                let fallback = args::encode_error("encoding", &err).unwrap_or_default();
                ResponseFrame::returning(connection, STATUS_ERROR, fallback)
            });

        if let Ok(frame) = frame {
            self.connections.write(connection, frame);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Stops a [`Server`] from another task or thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// What a registered function can reach while it runs.
pub struct Context<'a> {
    connection: ConnectionId,
    handles: &'a mut HandleRegistry,
    callbacks: &'a CallbackRouter,
    tasks: &'a TaskSender,
    runtime: &'a runtime::Handle,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        connection: ConnectionId,
        handles: &'a mut HandleRegistry,
        callbacks: &'a CallbackRouter,
        tasks: &'a TaskSender,
        runtime: &'a runtime::Handle,
    ) -> Self {
        Self {
            connection,
            handles,
            callbacks,
            tasks,
            runtime,
        }
    }

    /// The connection the current request arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn handles(&mut self) -> &mut HandleRegistry {
        self.handles
    }

    pub fn allocate_callback(&self, connection: ConnectionId) -> i32 {
        self.callbacks.allocate(connection)
    }

    pub fn trigger_callback(&self, callback_id: i32, args: &Args) -> bool {
        self.callbacks.trigger(callback_id, args)
    }

    /// Starts a timer that triggers `callback_id` with `args` every `period`.
    /// Store it with [`HandleRegistry::add_handle`] so the client can dispose
    /// of it later. A zero `period` is a handler error.
    pub fn start_timer(
        &self,
        period: Duration,
        callback_id: i32,
        args: Args,
    ) -> Result<Timer, HandlerError> {
        Timer::start(self.runtime, period, callback_id, args, self.tasks.clone())
    }
}
