//! Command line options of the `build-agent` binary.

use std::{path::PathBuf, time::Duration};

use build_agent_core::output::DEFAULT_HISTORY_BYTES;
use build_agent_session::{ControlPolicy, SessionConfig};
use clap::Parser;

use crate::{AgentConfig, CallbackConfig};

#[derive(Parser, Debug)]
#[command(name = "build-agent")]
#[command(author, version, about = "Runs build commands in terminals shared over WebSockets", long_about = None)]
pub struct Cli {
    /// Host name or address to listen on
    #[arg(short, long, default_value = "localhost", env = "BUILD_AGENT_BIND")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "BUILD_AGENT_PORT")]
    pub port: u16,

    /// Folder for session transcripts (no transcripts when omitted)
    #[arg(short, long, env = "BUILD_AGENT_LOG_FOLDER")]
    pub log_folder: Option<PathBuf>,

    /// Output bytes kept per session for reconnecting observers
    #[arg(long, default_value_t = DEFAULT_HISTORY_BYTES, env = "BUILD_AGENT_HISTORY_BYTES")]
    pub history_bytes: usize,

    /// Do not keep output for replay
    #[arg(long)]
    pub no_replay: bool,

    /// Seconds an idle session survives before it is destroyed
    #[arg(long, default_value_t = 10, env = "BUILD_AGENT_DESTROY_GRACE_SECS")]
    pub destroy_grace_secs: u64,

    /// What happens when a second observer asks for control (preempt, reject)
    #[arg(long, default_value_t = ControlPolicy::Preempt, env = "BUILD_AGENT_CONTROL_POLICY")]
    pub control_policy: ControlPolicy,

    /// Shell running the commands
    #[arg(long, env = "BUILD_AGENT_SHELL")]
    pub shell: Option<String>,

    /// Working directory of the commands
    #[arg(long, env = "BUILD_AGENT_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// URL receiving every status transition as a JSON POST
    #[arg(long, env = "BUILD_AGENT_STATUS_CALLBACK_URL")]
    pub status_callback_url: Option<String>,
}

impl Cli {
    #[must_use]
    pub fn into_config(self) -> AgentConfig {
        AgentConfig {
            bind: self.bind,
            port: self.port,
            session: SessionConfig {
                log_folder: self.log_folder,
                replay_enabled: !self.no_replay,
                history_bytes: self.history_bytes,
                destroy_grace: Duration::from_secs(self.destroy_grace_secs),
                control_policy: self.control_policy,
                ..SessionConfig::default()
            },
            shell: self.shell,
            working_dir: self.working_dir,
            status_callback: self.status_callback_url.map(CallbackConfig::new),
            ..AgentConfig::default()
        }
    }
}
