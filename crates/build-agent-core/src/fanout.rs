//! Per-subscriber bounded delivery queues.

use std::{collections::HashMap, fmt};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Identifies one subscriber of a broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Set of live subscribers, each fed through its own bounded queue.
///
/// Delivery never waits: a subscriber whose queue is full or whose receiver
/// was dropped is removed on the spot, so one slow consumer cannot hold up
/// the others.
pub(crate) struct Subscribers<T> {
    next_id: u64,
    capacity: usize,
    senders: HashMap<SubscriberId, mpsc::Sender<T>>,
    closed: bool,
}

impl<T: Clone> Subscribers<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity: capacity.max(1),
            senders: HashMap::new(),
            closed: false,
        }
    }

    /// Register a new subscriber.
    ///
    /// Once closed, the returned receiver is already disconnected.
    pub(crate) fn register(&mut self) -> (SubscriberId, mpsc::Receiver<T>) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        if !self.closed {
            self.senders.insert(id, tx);
        }
        (id, rx)
    }

    pub(crate) fn remove(&mut self, id: SubscriberId) -> bool {
        self.senders.remove(&id).is_some()
    }

    /// Offer `item` to every subscriber. Returns how many were dropped.
    pub(crate) fn deliver(&mut self, item: &T) -> usize {
        let before = self.senders.len();
        self.senders.retain(|id, tx| match tx.try_send(item.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %id, "Subscriber queue full, detaching");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = %id, "Subscriber gone, detaching");
                false
            }
        });
        before - self.senders.len()
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
