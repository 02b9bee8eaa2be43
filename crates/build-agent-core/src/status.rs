//! Task lifecycle status and its fan-out to status listeners.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::fanout::{SubscriberId, Subscribers};

/// Identifies one command execution. Unique for the lifetime of the agent.
pub type TaskId = u64;

/// Default number of events queued per status listener.
pub const DEFAULT_STATUS_QUEUE: usize = 256;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Process spawned, not yet producing output.
    Created,
    /// Process is running.
    Running,
    /// Process exited with code 0.
    Completed,
    /// Process exited with a non-zero code, or could not be run.
    Failed,
    /// Process was terminated on request.
    Killed,
}

impl TaskStatus {
    /// Whether no further transitions follow this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Upper-case name, as written to transcripts and the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub previous_status: TaskStatus,
    pub new_status: TaskStatus,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl StatusEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(task_id: TaskId, previous_status: TaskStatus, new_status: TaskStatus) -> Self {
        Self {
            task_id,
            previous_status,
            new_status,
            timestamp: now_millis(),
        }
    }
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Status broadcaster. Listeners only see events emitted after they attach.
pub struct StatusBroadcaster {
    subscribers: Mutex<Subscribers<StatusEvent>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STATUS_QUEUE)
    }

    #[must_use]
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::new(queue_capacity)),
        }
    }

    /// Deliver an event to every attached listener.
    pub fn publish(&self, event: &StatusEvent) {
        let mut subscribers = self.subscribers.lock();
        let dropped = subscribers.deliver(event);
        tracing::debug!(
            task_id = event.task_id,
            previous = %event.previous_status,
            new = %event.new_status,
            listeners = subscribers.len(),
            dropped,
            "Status update"
        );
    }

    /// Attach a listener.
    #[must_use]
    pub fn attach(&self) -> StatusSubscription {
        let (id, receiver) = self.subscribers.lock().register();
        StatusSubscription { id, receiver }
    }

    /// Detach a listener. Safe to call repeatedly.
    pub fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().remove(id)
    }

    /// End every listener stream.
    pub fn close(&self) {
        self.subscribers.lock().close();
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// A status listener's queue.
pub struct StatusSubscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<StatusEvent>,
}

impl StatusSubscription {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once detached or closed.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.receiver.recv().await
    }
}
