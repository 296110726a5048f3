use crate::{
    args,
    frame::{ConnectionId, ResponseFrame},
    net::server::ConnectionManager,
    types::Args,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

#[derive(Default)]
struct Bindings {
    next_id: i32,
    owners: HashMap<i32, ConnectionId>,
}

/// Allocates callback ids and pushes CALLBACK frames to the connection that
/// owns each id.
///
/// Cloning shares the same bindings, so a router can be handed to other
/// threads; triggering from anywhere goes through the connection's writer.
#[derive(Clone)]
pub struct CallbackRouter {
    bindings: Arc<Mutex<Bindings>>,
    connections: ConnectionManager,
}

impl CallbackRouter {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            bindings: Arc::default(),
            connections,
        }
    }

    /// Binds a fresh id to `connection`. Ids start at 0 and only grow.
    pub fn allocate(&self, connection: ConnectionId) -> i32 {
        let mut bindings = self.bindings.lock();
        let id = bindings.next_id;
        bindings.next_id += 1;
        bindings.owners.insert(id, connection);
        debug!(callback_id = id, connection, "allocated callback");
        id
    }

    pub fn owner(&self, callback_id: i32) -> Option<ConnectionId> {
        self.bindings.lock().owners.get(&callback_id).copied()
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> usize {
        self.bindings.lock().owners.len()
    }

    /// Sends `args` to the owner of `callback_id`.
    ///
    /// Returns whether a frame was queued. Unknown ids and disconnected
    /// owners are not errors: nothing is written and `false` comes back.
    pub fn trigger(&self, callback_id: i32, args: &Args) -> bool {
        let Some(connection) = self.owner(callback_id) else {
            debug!(callback_id, "trigger for unknown callback ignored");
            return false;
        };
        if !self.connections.is_live(connection) {
            debug!(callback_id, connection, "callback owner disconnected");
            return false;
        }

        let frame = args::encode_args(args)
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                ResponseFrame::callback(connection, callback_id, payload)
                    .map_err(|err| err.to_string())
            });
        match frame {
            Ok(frame) => self.connections.write(connection, frame),
            Err(err) => {
                warn!(callback_id, "could not encode callback arguments: {err}");
                false
            }
        }
    }
}
