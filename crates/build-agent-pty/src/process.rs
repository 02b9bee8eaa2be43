//! Spawning command lines inside a pseudo-terminal.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

use async_trait::async_trait;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;

use crate::shell::get_shell_command;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyDimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<PtyDimensions> for PtySize {
    fn from(size: PtyDimensions) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Spawn error.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Cannot open pseudo-terminal: {0}")]
    OpenPty(String),
    #[error("Cannot spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("Cannot attach to terminal: {0}")]
    Attach(String),
    #[error("Spawn task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: u32,
    pub success: bool,
}

impl From<portable_pty::ExitStatus> for ExitInfo {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            success: status.success(),
        }
    }
}

/// A process running inside a terminal.
///
/// The blocking handles are meant to be moved onto dedicated threads; the
/// `control` half stays with the owner for resizing and killing.
pub struct SpawnedProcess {
    /// OS process id, if known.
    pub pid: Option<u32>,
    /// Terminal output.
    pub output: Box<dyn Read + Send>,
    /// Terminal input.
    pub input: Box<dyn Write + Send>,
    /// Blocks until the process exits.
    pub child: ExitWaiter,
    pub control: ProcessControl,
}

/// Waits for a spawned process to exit.
pub struct ExitWaiter(Box<dyn Child + Send + Sync>);

impl ExitWaiter {
    /// Block until the process exits.
    ///
    /// # Errors
    /// Returns error if the exit status cannot be collected.
    pub fn wait(&mut self) -> io::Result<ExitInfo> {
        self.0.wait().map(ExitInfo::from)
    }
}

/// Resize and kill handles of a spawned process.
pub struct ProcessControl {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl ProcessControl {
    /// Resize the terminal.
    ///
    /// # Errors
    /// Returns error if the terminal rejects the new size.
    pub fn resize(&self, size: PtyDimensions) -> io::Result<()> {
        self.master.resize(size.into()).map_err(io::Error::other)
    }

    /// Terminate the process.
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    pub fn kill(&mut self) -> io::Result<()> {
        self.killer.kill()
    }
}

/// Starts command lines inside a terminal.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Run `command_line` in a new terminal of the given size.
    async fn spawn(
        &self,
        command_line: &str,
        size: PtyDimensions,
    ) -> Result<SpawnedProcess, SpawnError>;
}

/// `portable-pty` backed spawner running `<shell> -c <command line>`.
#[derive(Debug, Clone)]
pub struct PtySpawner {
    shell: PathBuf,
    shell_arg: &'static str,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl PtySpawner {
    /// Spawner using the platform shell.
    #[must_use]
    pub fn new() -> Self {
        let (shell, shell_arg) = get_shell_command();
        Self {
            shell: PathBuf::from(shell),
            shell_arg,
            working_dir: None,
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        }
    }

    /// Use a specific shell program.
    #[must_use]
    pub fn with_shell(mut self, shell: PathBuf) -> Self {
        self.shell = shell;
        self
    }

    /// Run commands in `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Add an environment variable for spawned commands.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell program in use.
    #[must_use]
    pub fn shell(&self) -> &std::path::Path {
        &self.shell
    }

    fn spawn_now(
        &self,
        command_line: &str,
        size: PtyDimensions,
    ) -> Result<SpawnedProcess, SpawnError> {
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg(self.shell_arg);
        cmd.arg(command_line);
        if let Some(dir) = &self.working_dir {
            cmd.cwd(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Spawn {
                command: command_line.to_string(),
                reason: e.to_string(),
            })?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|output| Ok((output, pair.master.take_writer()?)));
        let (output, input) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = killer.kill();
                return Err(SpawnError::Attach(e.to_string()));
            }
        };

        tracing::debug!(?pid, shell = %self.shell.display(), "Spawned process in terminal");

        Ok(SpawnedProcess {
            pid,
            output,
            input,
            child: ExitWaiter(child),
            control: ProcessControl {
                master: pair.master,
                killer,
            },
        })
    }
}

#[async_trait]
impl Spawner for PtySpawner {
    async fn spawn(
        &self,
        command_line: &str,
        size: PtyDimensions,
    ) -> Result<SpawnedProcess, SpawnError> {
        let spawner = self.clone();
        let command_line = command_line.to_string();
        tokio::task::spawn_blocking(move || spawner.spawn_now(&command_line, size)).await?
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    fn read_all(mut output: Box<dyn Read + Send>) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match output.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        collected
    }

    #[tokio::test]
    async fn runs_command_line_in_terminal() {
        let spawner = PtySpawner::new().with_shell(PathBuf::from("/bin/sh"));
        let process = assert_ok!(spawner.spawn("echo hi", PtyDimensions::default()).await);

        let SpawnedProcess {
            output, mut child, ..
        } = process;
        let text = tokio::task::spawn_blocking(move || read_all(output))
            .await
            .unwrap();
        let exit = assert_ok!(
            tokio::task::spawn_blocking(move || child.wait())
                .await
                .unwrap()
        );

        assert!(String::from_utf8_lossy(&text).contains("hi"));
        assert!(exit.success);
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let spawner = PtySpawner::new().with_shell(PathBuf::from("/bin/sh"));
        let SpawnedProcess {
            output, mut child, ..
        } = assert_ok!(spawner.spawn("exit 3", PtyDimensions::default()).await);
        drop(output);

        let exit = assert_ok!(
            tokio::task::spawn_blocking(move || child.wait())
                .await
                .unwrap()
        );
        assert_eq!(exit, ExitInfo { code: 3, success: false });
    }

    #[tokio::test]
    async fn missing_shell_fails_to_spawn() {
        let spawner = PtySpawner::new().with_shell(PathBuf::from("/no/such/shell"));
        let result = spawner.spawn("true", PtyDimensions::default()).await;
        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }

    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let spawner = PtySpawner::new().with_shell(PathBuf::from("/bin/sh"));
        let SpawnedProcess {
            mut child,
            mut control,
            ..
        } = assert_ok!(spawner.spawn("sleep 30", PtyDimensions::default()).await);

        assert_ok!(control.resize(PtyDimensions { cols: 120, rows: 40 }));
        assert_ok!(control.kill());
        let exit = assert_ok!(
            tokio::task::spawn_blocking(move || child.wait())
                .await
                .unwrap()
        );
        assert!(!exit.success);
    }
}
