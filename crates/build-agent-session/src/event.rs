//! Registry-wide feed of status transitions.

use build_agent_core::StatusEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default number of feed events buffered before new ones are dropped.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// A status transition tagged with the context it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub context: String,
    #[serde(flatten)]
    pub event: StatusEvent,
}

/// Sending half of the feed. Never waits: when the consumer falls behind,
/// events are dropped and logged.
#[derive(Debug, Clone)]
pub(crate) struct EventFeed(mpsc::Sender<SessionEvent>);

impl EventFeed {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self(tx), rx)
    }

    pub(crate) fn send(&self, context: &str, event: &StatusEvent) {
        let tagged = SessionEvent {
            context: context.to_string(),
            event: event.clone(),
        };
        if let Err(e) = self.0.try_send(tagged) {
            tracing::warn!(context, task_id = event.task_id, "Status feed dropped event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use build_agent_core::TaskStatus;

    use super::*;

    #[test]
    fn feed_json_adds_context_to_event_shape() {
        let event = SessionEvent {
            context: "/build-1".to_string(),
            event: StatusEvent {
                task_id: 9,
                previous_status: TaskStatus::Running,
                new_status: TaskStatus::Killed,
                timestamp: 5,
            },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "context": "/build-1",
                "taskId": 9,
                "previousStatus": "RUNNING",
                "newStatus": "KILLED",
                "timestamp": 5,
            })
        );
    }

    #[test]
    fn full_feed_drops_instead_of_waiting() {
        let (feed, mut rx) = EventFeed::channel(1);
        let event = StatusEvent::new(1, TaskStatus::Created, TaskStatus::Running);
        feed.send("/a", &event);
        feed.send("/a", &event);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
