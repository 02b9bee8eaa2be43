//! PTY process spawning for build agent tasks.
//!
//! Provides:
//! - `Spawner` - Seam for starting a command line inside a terminal
//! - `PtySpawner` - `portable-pty` backed implementation
//! - Shell detection utilities

pub mod process;
pub mod shell;

pub use process::{
    ExitInfo, ExitWaiter, ProcessControl, PtyDimensions, PtySpawner, SpawnError, SpawnedProcess,
    Spawner,
};
pub use shell::{UnixShell, get_shell_command, resolve_executable_path};
