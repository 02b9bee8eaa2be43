//! Observer attachments and their release on drop.

use std::{fmt, sync::Arc};

use build_agent_core::{OutputSubscription, StatusSubscription, SubscriberId};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::session::Session;

/// Identifies the observer holding control of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Keeps an observer registered with its session.
///
/// Dropping the guard detaches the observer's queues, releases control if
/// it still holds it, and lets the session go idle once nobody is left.
pub struct ObserverGuard {
    session: Arc<Session>,
    output: Option<SubscriberId>,
    status: Option<SubscriberId>,
    control: Option<ObserverId>,
}

impl ObserverGuard {
    pub(crate) fn new(
        session: Arc<Session>,
        output: Option<SubscriberId>,
        status: Option<SubscriberId>,
        control: Option<ObserverId>,
    ) -> Self {
        Self {
            session,
            output,
            status,
            control,
        }
    }

    /// Session this observer is attached to.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.session
            .release_observer(self.output.take(), self.status.take(), self.control.take());
    }
}

/// A controlling observer: may execute, write input, resize and kill.
pub struct ControlAttachment {
    pub holder: ObserverId,
    pub output: OutputSubscription,
    /// Resolves when another observer takes control.
    pub preempted: oneshot::Receiver<()>,
    pub guard: ObserverGuard,
}

/// A read-only observer of terminal output.
pub struct SpectateAttachment {
    pub output: OutputSubscription,
    pub guard: ObserverGuard,
}

/// A listener for task status transitions.
pub struct StatusAttachment {
    pub events: StatusSubscription,
    pub guard: ObserverGuard,
}
