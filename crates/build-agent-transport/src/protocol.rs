//! Wire protocol between observers and the agent.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use build_agent_core::{OutputFrame, TaskId};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the sequence number prefix of a binary output frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 input: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Binary frame of {0} bytes has no sequence header")]
    ShortFrame(usize),
}

/// Message from an observer to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a command line as the session's next task.
    Execute { command: String },
    /// Terminal input (base64 encoded).
    Input { data: String },
    /// Resize terminal.
    Resize { cols: u16, rows: u16 },
    /// Kill the running task.
    Kill,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    /// Returns error if the text is not a known message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Create an input message from raw bytes.
    #[must_use]
    pub fn input(data: &[u8]) -> Self {
        Self::Input {
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64. `None` for other messages.
    ///
    /// # Errors
    /// Returns error if the payload is not valid base64.
    pub fn decode_input(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self {
            Self::Input { data } => Ok(Some(BASE64.decode(data)?)),
            _ => Ok(None),
        }
    }
}

/// Message from the agent to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal output, decoded as lossy UTF-8 (text mode only).
    Output { seq: u64, data: String },
    /// A task was started on behalf of this observer.
    TaskStarted { task_id: TaskId },
    /// Another observer took control; the connection closes next.
    Preempted,
    /// Part of the requested replay was no longer retained.
    ReplayGap { requested: u64, first_available: u64 },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Text-mode rendering of an output frame.
    #[must_use]
    pub fn output(frame: &OutputFrame) -> Self {
        Self::Output {
            seq: frame.seq,
            data: String::from_utf8_lossy(&frame.data).into_owned(),
        }
    }

    #[must_use]
    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

/// Binary-mode rendering of an output frame: the big-endian sequence
/// number followed by the raw bytes.
#[must_use]
pub fn encode_frame(frame: &OutputFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.data.len());
    buf.put_u64(frame.seq);
    buf.put_slice(&frame.data);
    buf.freeze()
}

/// Parse a binary output frame.
///
/// # Errors
/// Returns error if the frame is shorter than its header.
pub fn decode_frame(bytes: &[u8]) -> Result<OutputFrame, ProtocolError> {
    let Some((header, data)) = bytes.split_first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(ProtocolError::ShortFrame(bytes.len()));
    };
    Ok(OutputFrame {
        seq: u64::from_be_bytes(*header),
        data: Bytes::copy_from_slice(data),
    })
}
