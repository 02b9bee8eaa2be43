//! Core building blocks for build agent sessions.
//!
//! This crate provides:
//! - `OutputBroadcaster` - Output fan-out with a bounded replay buffer
//! - `StatusBroadcaster` - Task lifecycle events for status listeners
//! - `TranscriptLog` - Append-only on-disk record of commands and output
//! - `TaskStatus` / `StatusEvent` - Task lifecycle types

pub mod fanout;
pub mod output;
pub mod status;
pub mod transcript;

pub use fanout::SubscriberId;
pub use output::{OutputBroadcaster, OutputFrame, OutputSubscription, ReplayFrom};
pub use status::{StatusBroadcaster, StatusEvent, StatusSubscription, TaskId, TaskStatus};
pub use transcript::TranscriptLog;
