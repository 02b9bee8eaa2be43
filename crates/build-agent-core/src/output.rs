//! Output fan-out with a bounded replay buffer for reconnecting observers.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::fanout::{SubscriberId, Subscribers};

/// Default replay buffer size (1 MiB).
pub const DEFAULT_HISTORY_BYTES: usize = 1024 * 1024;

/// Default number of frames queued per subscriber before it is detached.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Where a new subscriber's output starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayFrom {
    /// Live output only.
    #[default]
    Live,
    /// Everything still retained.
    Start,
    /// Frames after the last one the subscriber saw.
    After(u64),
}

impl ReplayFrom {
    /// First sequence number wanted from the replay buffer.
    #[must_use]
    pub const fn first_wanted(self) -> Option<u64> {
        match self {
            Self::Live => None,
            Self::Start => Some(0),
            Self::After(last_seen) => Some(last_seen.saturating_add(1)),
        }
    }
}

/// A chunk of terminal output tagged with its position in the session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    /// Sequence number, starting at 0 and increasing by one per frame.
    pub seq: u64,
    /// Raw bytes as read from the terminal.
    pub data: Bytes,
}

struct Inner {
    history: VecDeque<OutputFrame>,
    total_bytes: usize,
    next_seq: u64,
    subscribers: Subscribers<OutputFrame>,
}

/// Output broadcaster with replay support.
///
/// New subscribers may ask for the retained history from a given sequence
/// number onwards and then continue with live frames. History snapshot and
/// live registration happen under one lock, so nothing is lost or repeated
/// between the two.
pub struct OutputBroadcaster {
    inner: Mutex<Inner>,
    history_limit: usize,
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBroadcaster {
    /// Create a broadcaster with the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HISTORY_BYTES, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a broadcaster retaining up to `history_bytes` of output.
    ///
    /// A zero `history_bytes` disables replay entirely.
    #[must_use]
    pub fn with_limits(history_bytes: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                next_seq: 0,
                subscribers: Subscribers::new(queue_capacity),
            }),
            history_limit: history_bytes,
        }
    }

    /// Publish a chunk to live subscribers and the replay buffer.
    ///
    /// Returns the sequence number assigned to the chunk.
    pub fn publish(&self, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let bytes = data.len();

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let frame = OutputFrame { seq, data };
        inner.subscribers.deliver(&frame);

        if self.history_limit > 0 {
            while inner.total_bytes.saturating_add(bytes) > self.history_limit {
                let Some(front) = inner.history.pop_front() else {
                    break;
                };
                inner.total_bytes = inner.total_bytes.saturating_sub(front.data.len());
            }
            // A frame larger than the whole buffer is not retained; replays
            // asking for it report a gap.
            if bytes <= self.history_limit {
                inner.history.push_back(frame);
                inner.total_bytes = inner.total_bytes.saturating_add(bytes);
            }
        }

        seq
    }

    /// Attach a subscriber.
    ///
    /// Retained frames selected by `replay` are returned in the
    /// subscription's replay list, followed by live frames. If some of them
    /// were already evicted, replay starts at the oldest retained frame and
    /// [`OutputSubscription::gap`] reports it.
    #[must_use]
    pub fn attach(&self, replay: ReplayFrom) -> OutputSubscription {
        let mut inner = self.inner.lock();
        let (id, receiver) = inner.subscribers.register();

        let first_available = inner.history.front().map_or(inner.next_seq, |f| f.seq);
        let requested = replay.first_wanted();
        let (frames, gap) = match requested {
            None => (VecDeque::new(), false),
            Some(from) => {
                let frames = inner
                    .history
                    .iter()
                    .filter(|f| f.seq >= from)
                    .cloned()
                    .collect();
                (frames, from < first_available)
            }
        };

        OutputSubscription {
            id,
            replay: frames,
            gap,
            requested,
            first_available,
            receiver,
        }
    }

    /// Stop delivering to a subscriber. Safe to call repeatedly.
    pub fn detach(&self, id: SubscriberId) -> bool {
        self.inner.lock().subscribers.remove(id)
    }

    /// Close the broadcaster: every subscriber stream ends and later
    /// attaches receive an already-ended stream.
    pub fn close(&self) {
        self.inner.lock().subscribers.close();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().subscribers.is_closed()
    }

    /// Sequence number the next published frame will receive.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Bytes currently held in the replay buffer.
    #[must_use]
    pub fn history_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// A subscriber's view of the output: replayed history plus a live queue.
pub struct OutputSubscription {
    id: SubscriberId,
    replay: VecDeque<OutputFrame>,
    gap: bool,
    requested: Option<u64>,
    first_available: u64,
    receiver: mpsc::Receiver<OutputFrame>,
}

impl OutputSubscription {
    /// Subscriber id, used to detach.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether part of the requested history had already been evicted.
    #[must_use]
    pub const fn gap(&self) -> bool {
        self.gap
    }

    /// First sequence number asked for at attach time.
    #[must_use]
    pub const fn requested(&self) -> Option<u64> {
        self.requested
    }

    /// Oldest sequence number still retained when the subscriber attached.
    #[must_use]
    pub const fn first_available(&self) -> u64 {
        self.first_available
    }

    /// Replayed frames not yet received, oldest first.
    #[must_use]
    pub const fn replay(&self) -> &VecDeque<OutputFrame> {
        &self.replay
    }

    /// Receive the next frame, replay first. `None` once detached or closed.
    pub async fn recv(&mut self) -> Option<OutputFrame> {
        if let Some(frame) = self.replay.pop_front() {
            return Some(frame);
        }
        self.receiver.recv().await
    }

    /// Stream that yields the replay first, then live frames.
    #[must_use]
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, OutputFrame> {
        let replay = futures::stream::iter(self.replay);
        let live = ReceiverStream::new(self.receiver);
        replay.chain(live).boxed()
    }
}
