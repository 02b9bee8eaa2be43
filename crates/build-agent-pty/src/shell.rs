//! Shell selection for running task command lines.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Returns the shell program and the flag that makes it run one command line.
///
/// Returns `(shell_program, shell_arg)` where:
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the `$SHELL` program with `-c`, or `/bin/sh -c`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        UnixShell::current_shell().get_shell_command()
    }
}

/// Resolve an executable by name.
///
/// Absolute paths are accepted as-is when they point at a file; anything
/// else is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Get the current shell from `$SHELL`, falling back to `/bin/sh`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Create from an absolute path to an existing file.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (String, &'static str) {
        (self.path().to_string_lossy().into_owned(), "-c")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_file_name() {
        let sh = UnixShell::from_path(Path::new("/bin/sh")).expect("expected Some");
        assert_eq!(sh, UnixShell::Sh(PathBuf::from("/bin/sh")));
        assert_eq!(sh.get_shell_command(), ("/bin/sh".to_string(), "-c"));
    }

    #[test]
    fn rejects_relative_or_missing_paths() {
        assert!(UnixShell::from_path(Path::new("sh")).is_none());
        assert!(UnixShell::from_path(Path::new("/definitely/not/a/shell")).is_none());
    }

    #[tokio::test]
    async fn resolves_sh_on_path() {
        let found = resolve_executable_path("sh").await;
        assert!(found.is_some_and(|p| p.is_absolute()));
        assert!(resolve_executable_path("  ").await.is_none());
    }
}
