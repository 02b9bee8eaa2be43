//! Attach path parsing.
//!
//! An attach path is a mode prefix followed directly by the context, with an
//! optional trailing `/ro` for read-only terminals:
//! `/socket/term/build-42/ro` attaches a binary spectator to `/build-42`.

/// Default binary terminal prefix.
pub const DEFAULT_TERM_PATH: &str = "/socket/term";
/// Default text terminal prefix.
pub const DEFAULT_TEXT_PATH: &str = "/socket/text";
/// Default status listener prefix.
pub const DEFAULT_STATUS_PATH: &str = "/socket/process-status-updates";

const READ_ONLY_SUFFIX: &str = "/ro";

/// How terminal output is framed on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Binary frames: sequence header plus raw bytes.
    Binary,
    /// JSON `output` messages.
    Text,
}

/// What an observer attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    Terminal { mode: OutputMode, read_only: bool },
    Status,
}

/// A resolved attach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub context: String,
    pub kind: AttachKind,
}

/// Path prefixes of the attach endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPaths {
    pub term: String,
    pub text: String,
    pub status: String,
}

impl Default for AttachPaths {
    fn default() -> Self {
        Self {
            term: DEFAULT_TERM_PATH.to_string(),
            text: DEFAULT_TEXT_PATH.to_string(),
            status: DEFAULT_STATUS_PATH.to_string(),
        }
    }
}

impl AttachPaths {
    /// Resolve a request path. `None` if it matches no endpoint.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<AttachTarget> {
        let mut endpoints = [
            (self.status.as_str(), None),
            (self.term.as_str(), Some(OutputMode::Binary)),
            (self.text.as_str(), Some(OutputMode::Text)),
        ];
        // Longest prefix wins when one endpoint nests inside another.
        endpoints.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));

        endpoints.into_iter().find_map(|(prefix, mode)| {
            let rest = path.strip_prefix(prefix)?;
            if !(rest.is_empty() || rest.starts_with('/')) {
                return None;
            }
            let (context, read_only) = split_read_only(rest);
            let kind = match mode {
                Some(mode) => AttachKind::Terminal { mode, read_only },
                None => AttachKind::Status,
            };
            Some(AttachTarget {
                context: context.to_string(),
                kind,
            })
        })
    }
}

fn split_read_only(rest: &str) -> (&str, bool) {
    let cut = rest.len().saturating_sub(READ_ONLY_SUFFIX.len());
    match (rest.get(..cut), rest.get(cut..)) {
        (Some(context), Some(suffix)) if suffix.eq_ignore_ascii_case(READ_ONLY_SUFFIX) => {
            (context, true)
        }
        _ => (rest, false),
    }
}
