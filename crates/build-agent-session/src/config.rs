//! Session settings shared by every session of a registry.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use build_agent_core::{
    OutputBroadcaster, TranscriptLog,
    output::{DEFAULT_HISTORY_BYTES, DEFAULT_QUEUE_CAPACITY},
};
use build_agent_pty::PtyDimensions;

/// Default delay between a session going idle and its destruction.
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(10);

/// What happens when a second observer asks for control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlPolicy {
    /// The newcomer takes control; the previous holder is told and dropped.
    #[default]
    Preempt,
    /// The newcomer is refused while control is held.
    Reject,
}

impl fmt::Display for ControlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preempt => "preempt",
            Self::Reject => "reject",
        })
    }
}

/// Unknown control policy name.
#[derive(Debug, thiserror::Error)]
#[error("Unknown control policy `{0}`, expected `preempt` or `reject`")]
pub struct ParsePolicyError(String);

impl FromStr for ControlPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "preempt" => Ok(Self::Preempt),
            "reject" => Ok(Self::Reject),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Folder for transcripts. `None` disables transcripts.
    pub log_folder: Option<PathBuf>,
    /// Whether observers may ask for retained output.
    pub replay_enabled: bool,
    /// Replay buffer size per session.
    pub history_bytes: usize,
    /// Frames queued per observer before it is detached as too slow.
    pub queue_capacity: usize,
    /// Idle time before an unused session is destroyed.
    pub destroy_grace: Duration,
    pub control_policy: ControlPolicy,
    /// Initial terminal size of spawned tasks.
    pub pty_size: PtyDimensions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_folder: None,
            replay_enabled: true,
            history_bytes: DEFAULT_HISTORY_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            destroy_grace: DEFAULT_DESTROY_GRACE,
            control_policy: ControlPolicy::default(),
            pty_size: PtyDimensions::default(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn output_broadcaster(&self) -> OutputBroadcaster {
        let history = if self.replay_enabled {
            self.history_bytes
        } else {
            0
        };
        OutputBroadcaster::with_limits(history, self.queue_capacity)
    }

    pub(crate) fn transcript_for(&self, context: &str) -> TranscriptLog {
        self.log_folder.as_deref().map_or_else(TranscriptLog::disabled, |folder| {
            TranscriptLog::for_context(folder, context)
        })
    }
}
