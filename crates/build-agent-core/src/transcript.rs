//! Append-only transcript of a session's commands and output.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};

use crate::status::TaskStatus;

/// File name used for the empty context.
pub const DEFAULT_TRANSCRIPT_NAME: &str = "console.log";

enum State {
    /// Not opened yet; opened on first write.
    Pending,
    Open(BufWriter<File>),
    /// Opening failed; further writes are dropped.
    Broken,
    Closed,
}

/// Transcript writer.
///
/// Every write is appended and flushed in call order. Failures are logged
/// and swallowed: a broken transcript never interrupts the running command.
pub struct TranscriptLog {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl TranscriptLog {
    /// Transcript that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::Closed),
        }
    }

    /// Transcript appending to `path`. The file is opened lazily.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            state: Mutex::new(State::Pending),
        }
    }

    /// Transcript for `context` inside `folder`.
    #[must_use]
    pub fn for_context(folder: &Path, context: &str) -> Self {
        Self::new(folder.join(file_name_for(context)))
    }

    /// Target file, if enabled.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an issued command as `% <command>\r\n`.
    pub async fn log_command(&self, command: &str) {
        self.append(format!("% {command}\r\n").as_bytes()).await;
    }

    /// Record raw process output.
    pub async fn log_output(&self, bytes: &[u8]) {
        self.append(bytes).await;
    }

    /// Record the closing line of a task.
    pub async fn log_status(&self, status: TaskStatus) {
        self.append(format!("# Finished with status: {status}\r\n").as_bytes())
            .await;
    }

    /// Flush and close the file. Safe to call more than once.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let State::Open(writer) = &mut *state {
            if let Err(e) = writer.flush().await {
                tracing::error!(path = ?self.path, "Cannot flush transcript: {e}");
            }
        }
        *state = State::Closed;
    }

    async fn append(&self, bytes: &[u8]) {
        let Some(path) = self.path.as_deref() else {
            return;
        };

        let mut state = self.state.lock().await;
        if matches!(*state, State::Pending) {
            *state = match open(path).await {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "Opened transcript");
                    State::Open(BufWriter::new(file))
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), "Cannot open transcript: {e}");
                    State::Broken
                }
            };
        }

        let State::Open(writer) = &mut *state else {
            return;
        };
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(path = %path.display(), "Cannot write to transcript: {e}");
        }
    }
}

async fn open(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Transcript file name for a context.
///
/// Distinct contexts get distinct names. The leading slash is dropped, inner
/// slashes become `_` and every other byte outside `[A-Za-z0-9.-]` is written
/// as `%XX`. Contexts that would otherwise clash with the empty context's
/// `console.log` or have no leading slash are encoded whole behind a `~`.
#[must_use]
pub fn file_name_for(context: &str) -> String {
    if context.is_empty() {
        return DEFAULT_TRANSCRIPT_NAME.to_string();
    }
    let name = match context.strip_prefix('/') {
        Some(rest) if !rest.is_empty() => format!("{}.log", encode_context(rest)),
        _ => String::new(),
    };
    if name.is_empty() || name == DEFAULT_TRANSCRIPT_NAME {
        return format!("~{}.log", encode_context(context));
    }
    name
}

fn encode_context(context: &str) -> String {
    let mut encoded = String::with_capacity(context.len());
    for byte in context.bytes() {
        match byte {
            b'/' => encoded.push('_'),
            b'.' | b'-' => encoded.push(char::from(byte)),
            _ if byte.is_ascii_alphanumeric() => encoded.push(char::from(byte)),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
