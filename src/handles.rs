//! Integer handles to host-side resources.
//!
//! Only the consumer touches the registry, so it carries no lock. Nothing is
//! cleaned up implicitly: a timer whose handle is removed without
//! [`Timer::dispose`] keeps firing for the life of the process.

use crate::{
    dispatcher::HandlerError,
    queue::{Task, TaskSender},
    types::{Args, Value},
};
use std::{collections::HashMap, time::Duration};
use tokio::{runtime, task::JoinHandle, time};
use tracing::debug;

/// The closed set of things a handle may refer to.
#[derive(Debug)]
pub enum Resource {
    Timer(Timer),
    Value(Value),
}

#[derive(Debug)]
pub struct HandleRegistry {
    resources: HashMap<i32, Resource>,
    next_id: i32,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self {
            resources: HashMap::new(),
            next_id: 1,
        }
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `resource` under the next id. Ids start at 1 and are never
    /// handed out twice.
    pub fn add_handle(&mut self, resource: Resource) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(id, resource);
        id
    }

    pub fn get_object(&self, id: i32) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn get_object_mut(&mut self, id: i32) -> Option<&mut Resource> {
        self.resources.get_mut(&id)
    }

    pub fn get_timer(&self, id: i32) -> Option<&Timer> {
        match self.resources.get(&id) {
            Some(Resource::Timer(timer)) => Some(timer),
            _ => None,
        }
    }

    /// True if `id` was present.
    pub fn remove_handle(&mut self, id: i32) -> bool {
        self.take(id).is_some()
    }

    /// Removes and returns the resource so the caller can dispose of it.
    pub fn take(&mut self, id: i32) -> Option<Resource> {
        self.resources.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A periodic trigger of one callback.
///
/// Each tick queues the trigger on the dispatch queue; the frame is sent
/// when the consumer next drains it.
#[derive(Debug)]
pub struct Timer {
    task: JoinHandle<()>,
    period: Duration,
    callback_id: i32,
}

impl Timer {
    /// Fails for a zero `period`.
    pub(crate) fn start(
        runtime: &runtime::Handle,
        period: Duration,
        callback_id: i32,
        args: Args,
        tasks: TaskSender,
    ) -> Result<Self, HandlerError> {
        if period.is_zero() {
            return Err(HandlerError::new("timer period must be non-zero"));
        }
        let task = runtime.spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let queued = tasks.send(Task::Trigger {
                    callback_id,
                    args: args.clone(),
                });
                if !queued {
                    break;
                }
            }
        });
        debug!(callback_id, ?period, "timer started");
        Ok(Self {
            task,
            period,
            callback_id,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn callback_id(&self) -> i32 {
        self.callback_id
    }

    pub fn dispose(&self) {
        self.task.abort();
        debug!(callback_id = self.callback_id, "timer disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.task.is_finished()
    }
}
