//! The dispatch queue between connection readers and the single consumer.
//!
//! Readers (and timers) hold cloned [`TaskSender`]s; the [`Server`] owns the
//! only [`TaskReceiver`] and drains it on the host's thread.
//!
//! [`Server`]: crate::Server

use crate::{frame::ConnectionId, types::Args};
use tokio::sync::mpsc::{self, error::TryRecvError};

/// One decoded request waiting to be executed.
#[derive(Debug)]
pub(crate) struct DispatchTask {
    pub(crate) connection: ConnectionId,
    pub(crate) request_id: i32,
    pub(crate) function: String,
    pub(crate) payload: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum Task {
    Call(DispatchTask),
    /// Fire a callback from the consumer; produced by timers.
    Trigger { callback_id: i32, args: Args },
}

#[derive(Debug, Clone)]
pub(crate) struct TaskSender(mpsc::UnboundedSender<Task>);

impl TaskSender {
    /// Returns false once the consumer side is gone.
    pub(crate) fn send(&self, task: Task) -> bool {
        self.0.send(task).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct TaskReceiver(mpsc::UnboundedReceiver<Task>);

impl TaskReceiver {
    /// Next queued task without waiting. `None` when the queue is empty or
    /// every sender is gone.
    pub(crate) fn try_next(&mut self) -> Option<Task> {
        match self.0.try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) async fn next(&mut self) -> Option<Task> {
        self.0.recv().await
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) fn channel() -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskSender(tx), TaskReceiver(rx))
}
