use crate::{
    args::{self, ArgsError, Outcome},
    frame::{self, ConnectionId, FrameError, MessageKind, ResponseFrame, DEFAULT_MAX_PAYLOAD_LEN},
    types::{Args, Value},
    ALLOCATE_CALLBACK,
};
use std::io;
use thiserror::Error;
use tokio::{
    io::{BufReader, BufWriter},
    net::{tcp::OwnedWriteHalf, TcpStream, ToSocketAddrs},
    sync::mpsc,
    task::{self, JoinHandle},
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connecting: {0}")]
    Connect(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Args(#[from] ArgsError),

    #[error("server closed the connection")]
    Disconnected,

    #[error("expected a greeting, got {0:?}")]
    BadGreeting(MessageKind),

    #[error("{function} failed ({kind}): {message}")]
    Remote {
        function: String,
        kind: String,
        message: String,
    },
}

/// A RETURN frame.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: i32,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == frame::STATUS_OK
    }

    pub fn outcome(&self) -> Result<Outcome, ArgsError> {
        args::decode_result(&self.payload)
    }
}

/// A CALLBACK frame pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub callback_id: i32,
    pub args: Args,
}

/// A connection to a [`Server`](crate::Server).
///
/// Calls are strictly one at a time: each waits for the next RETURN frame.
/// Callback frames are collected in the background and handed out by
/// [`next_callback`](Self::next_callback).
pub struct Client {
    connection_id: ConnectionId,
    writer: BufWriter<OwnedWriteHalf>,
    returns: mpsc::UnboundedReceiver<Reply>,
    callbacks: mpsc::UnboundedReceiver<Callback>,
    next_request_id: i32,
    reader: JoinHandle<()>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let sock = TcpStream::connect(addr).await?;
        sock.set_nodelay(true)?;
        let (read_half, write_half) = sock.into_split();
        let mut read_half = BufReader::new(read_half);

        let greeting = frame::read_response(&mut read_half, DEFAULT_MAX_PAYLOAD_LEN).await?;
        if greeting.header.kind != MessageKind::Return {
            return Err(ClientError::BadGreeting(greeting.header.kind));
        }
        let connection_id = greeting.header.connection_id;
        debug!(connection = connection_id, "connected");

        let (returns_tx, returns) = mpsc::unbounded_channel();
        let (callbacks_tx, callbacks) = mpsc::unbounded_channel();
        let reader = task::spawn(async move {
            loop {
                let frame = match frame::read_response(&mut read_half, DEFAULT_MAX_PAYLOAD_LEN).await {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("client reader stopped: {err}");
                        break;
                    }
                };
                if !route(frame, &returns_tx, &callbacks_tx) {
                    break;
                }
            }
        });

        Ok(Self {
            connection_id,
            writer: BufWriter::new(write_half),
            returns,
            callbacks,
            next_request_id: 0,
            reader,
        })
    }

    /// The id the server assigned in its greeting.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Sends one request and waits for its RETURN frame.
    pub async fn call_raw(&mut self, function: &str, args: &Args) -> Result<Reply, ClientError> {
        let payload = args::encode_args(args)?;
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        frame::write_request(&mut self.writer, request_id, function, &payload).await?;
        self.returns.recv().await.ok_or(ClientError::Disconnected)
    }

    /// Calls `function`, turning status 1 into [`ClientError::Remote`].
    pub async fn call(&mut self, function: &str, args: &Args) -> Result<Value, ClientError> {
        let reply = self.call_raw(function, args).await?;
        let outcome = reply.outcome()?;
        if reply.is_ok() {
            return Ok(outcome.value());
        }
        Err(ClientError::Remote {
            function: function.to_owned(),
            kind: outcome.error.unwrap_or_default(),
            message: outcome.text,
        })
    }

    /// Asks the server for a callback id owned by this connection.
    pub async fn allocate_callback(&mut self) -> Result<i32, ClientError> {
        let args = Value::args([("clientId", self.connection_id)]);
        match self.call(ALLOCATE_CALLBACK, &args).await? {
            Value::Int(id) => i32::try_from(id).map_err(|_| bad_callback_id(Value::Int(id))),
            other => Err(bad_callback_id(other)),
        }
    }

    /// The next callback pushed by the server, or `None` once disconnected.
    pub async fn next_callback(&mut self) -> Option<Callback> {
        self.callbacks.recv().await
    }

    /// A callback that has already arrived, without waiting.
    pub fn try_next_callback(&mut self) -> Option<Callback> {
        self.callbacks.try_recv().ok()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn bad_callback_id(value: Value) -> ClientError {
    ClientError::Remote {
        function: ALLOCATE_CALLBACK.to_owned(),
        kind: "result_type".to_owned(),
        message: format!("not a callback id: {value:?}"),
    }
}

/// Returns false when nobody is listening any more.
fn route(
    frame: ResponseFrame,
    returns: &mpsc::UnboundedSender<Reply>,
    callbacks: &mpsc::UnboundedSender<Callback>,
) -> bool {
    match frame.header.kind {
        MessageKind::Return => returns
            .send(Reply {
                status: frame.header.status_or_callback_id,
                payload: frame.payload,
            })
            .is_ok(),
        MessageKind::Callback => {
            let callback_id = frame.header.status_or_callback_id;
            match args::decode_args(&frame.payload) {
                Ok(args) => callbacks.send(Callback { callback_id, args }).is_ok(),
                Err(err) => {
                    debug!(callback_id, "dropping undecodable callback: {err}");
                    true
                }
            }
        }
    }
}
