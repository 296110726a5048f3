//! A cross-process RPC bridge.
//!
//! A host process registers named functions on a [`Server`]; clients connect
//! over TCP and call them with framed requests. Connections are read on
//! background tasks, but every registered function runs on the host's own
//! thread when it calls [`Server::process_pending`] (or serves with
//! [`Server::wait_for_all_connections`]). Functions can push callbacks back to
//! the client that allocated them.

pub mod args;
pub mod callbacks;
pub mod config;
mod dispatcher;
pub mod frame;
pub mod handles;
mod macros;
pub mod net;
mod queue;
pub mod server;
pub mod types;

pub use callbacks::CallbackRouter;
pub use config::{ConfigError, ServerConfig};
pub use dispatcher::{CallError, DispatchError, HandlerError, RpcFunctionInfo};
pub use frame::{ConnectionId, FrameError, MessageKind};
pub use handles::{HandleRegistry, Resource, Timer};
pub use net::client::{Callback, Client, ClientError, Reply};
pub use server::{Context, Server, ShutdownHandle};
pub use types::{Args, Param, Signature, Type, Value};

use types::{Arguments, Encode};

/// A function the server can call by name.
///
/// `Domain` is a tuple of parameter types, bound by name using the
/// parameter list of [`signature`](Self::signature).
pub trait RpcFunction {
    type Domain: Arguments;
    type Range: Encode;

    fn name(&self) -> &str;
    fn signature(&self) -> Signature;
    fn call(&self, cx: &mut Context<'_>, args: Self::Domain) -> Result<Self::Range, HandlerError>;
}

/// Name of the builtin every server exposes.
pub const ALLOCATE_CALLBACK: &str = "_RPC::AllocateCallback";

/// `_RPC::AllocateCallback(clientId: int) -> int`
pub struct AllocateCallback;

impl RpcFunction for AllocateCallback {
    type Domain = (ConnectionId,);
    type Range = i32;

    name!(ALLOCATE_CALLBACK);
    signature!(infer ["clientId"]);

    fn call(&self, cx: &mut Context<'_>, (client_id,): (ConnectionId,)) -> Result<i32, HandlerError> {
        Ok(cx.allocate_callback(client_id))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        callbacks::CallbackRouter,
        handles::HandleRegistry,
        net::server::ConnectionManager,
        queue::{self, TaskReceiver, TaskSender},
        server::Context,
        ConnectionId,
    };

    /// Owns everything a [`Context`] borrows, for calling functions without
    /// a socket.
    pub(crate) struct Harness {
        pub(crate) handles: HandleRegistry,
        pub(crate) callbacks: CallbackRouter,
        tasks: TaskSender,
        _queue: TaskReceiver,
        runtime: tokio::runtime::Runtime,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let (tasks, queue) = queue::channel();
            Self {
                handles: HandleRegistry::new(),
                callbacks: CallbackRouter::new(ConnectionManager::new()),
                tasks,
                _queue: queue,
                runtime: tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap(),
            }
        }

        pub(crate) fn cx(&mut self, connection: ConnectionId) -> Context<'_> {
            Context::new(
                connection,
                &mut self.handles,
                &self.callbacks,
                &self.tasks,
                self.runtime.handle(),
            )
        }
    }
}
