//! Connection management: accept loop, per-connection reader and writer
//! tasks, and the table of live connections.

use crate::{
    config::ServerConfig,
    frame::{self, ConnectionId, FrameError, ResponseFrame},
    queue::{DispatchTask, Task, TaskSender},
};
use parking_lot::Mutex;
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, watch},
    task::{self, AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};

struct Connection {
    outbound: mpsc::UnboundedSender<ResponseFrame>,
    reader: Option<AbortHandle>,
}

#[derive(Default)]
struct Table {
    next_id: ConnectionId,
    live: HashMap<ConnectionId, Connection>,
}

/// The set of live connections, keyed by connection id.
///
/// Presence in the table is the liveness flag: writes to an id that is not
/// present are dropped silently.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    table: Arc<Mutex<Table>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection whose frames go to `outbound` and returns its id.
    /// Ids start at 1 and are never reused.
    pub(crate) fn register(&self, outbound: mpsc::UnboundedSender<ResponseFrame>) -> ConnectionId {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.live.insert(
            id,
            Connection {
                outbound,
                reader: None,
            },
        );
        id
    }

    fn attach_reader(&self, id: ConnectionId, reader: AbortHandle) {
        match self.table.lock().live.get_mut(&id) {
            Some(connection) => connection.reader = Some(reader),
            // Closed before the reader started.
            None => reader.abort(),
        }
    }

    /// Queues `frame` on connection `id`. Returns false, without error, if
    /// the connection is gone.
    pub fn write(&self, id: ConnectionId, frame: ResponseFrame) -> bool {
        let table = self.table.lock();
        match table.live.get(&id) {
            Some(connection) => connection.outbound.send(frame).is_ok(),
            None => {
                debug!(connection = id, "dropping frame for closed connection");
                false
            }
        }
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.table.lock().live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.table.lock().live.len()
    }

    /// Removes the connection and stops its reader. Dropping the outbound
    /// sender ends the writer, which closes the socket.
    pub fn close(&self, id: ConnectionId) -> bool {
        let removed = self.table.lock().live.remove(&id);
        match removed {
            Some(connection) => {
                if let Some(reader) = connection.reader {
                    reader.abort();
                }
                info!(connection = id, "connection closed");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.table.lock().live.drain().collect();
        for (id, connection) in drained {
            if let Some(reader) = connection.reader {
                reader.abort();
            }
            debug!(connection = id, "connection closed on shutdown");
        }
    }
}

pub(crate) async fn bind(config: &ServerConfig) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("RPC server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Spawns the accept loop. It runs until `shutdown` flips to true.
pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    config: ServerConfig,
    connections: ConnectionManager,
    tasks: TaskSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            };
            match accepted {
                Ok((sock, addr)) => accept(sock, addr, &config, &connections, &tasks),
                Err(err) => warn!("accept failed: {err}"),
            }
        }
        debug!("accept loop stopped");
    })
}

fn accept(
    sock: TcpStream,
    addr: SocketAddr,
    config: &ServerConfig,
    connections: &ConnectionManager,
    tasks: &TaskSender,
) {
    if config.nodelay {
        if let Err(err) = sock.set_nodelay(true) {
            debug!("set_nodelay failed for {addr}: {err}");
        }
    }
    let (read_half, write_half) = sock.into_split();

    let (outbound, frames) = mpsc::unbounded_channel();
    let id = connections.register(outbound);
    info!(connection = id, %addr, "accepted connection");

    // The greeting is queued before the reader exists, so it is always the
    // first frame the client sees.
    connections.write(id, ResponseFrame::greeting(id));

    task::spawn(write_loop(id, write_half, frames, connections.clone()));
    let reader = task::spawn(read_loop(
        id,
        read_half,
        config.max_payload_len,
        tasks.clone(),
        connections.clone(),
    ));
    connections.attach_reader(id, reader.abort_handle());
}

async fn read_loop(
    id: ConnectionId,
    read_half: OwnedReadHalf,
    max_payload_len: usize,
    tasks: TaskSender,
    connections: ConnectionManager,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match frame::read_request(&mut reader, max_payload_len).await {
            Ok((header, payload)) => {
                debug!(
                    connection = id,
                    request_id = header.request_id,
                    function = %header.function_name,
                    payload_len = payload.len(),
                    "request received"
                );
                let queued = tasks.send(Task::Call(DispatchTask {
                    connection: id,
                    request_id: header.request_id,
                    function: header.function_name,
                    payload,
                }));
                if !queued {
                    debug!(connection = id, "dispatch queue closed");
                    break;
                }
            }
            Err(FrameError::Closed) => {
                debug!(connection = id, "peer disconnected");
                break;
            }
            Err(err) => {
                warn!(connection = id, "closing connection: {err}");
                break;
            }
        }
    }
    connections.close(id);
}

async fn write_loop(
    id: ConnectionId,
    write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<ResponseFrame>,
    connections: ConnectionManager,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = frames.recv().await {
        if let Err(err) = frame::write_response(&mut writer, &frame).await {
            debug!(connection = id, "write failed: {err}");
            connections.close(id);
            return;
        }
    }
}
