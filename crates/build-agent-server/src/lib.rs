//! Build agent server.
//!
//! Provides:
//! - `AgentServer` - Binds the listener and serves the agent router
//! - `AgentConfig` - Everything needed to start one
//! - `cli` - Command line front end producing an `AgentConfig`
//! - `callback` - Forwarding of status transitions to an HTTP endpoint

pub mod callback;
pub mod cli;

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};

use build_agent_client::{BoundedRetryingClient, ClientError};
use build_agent_pty::{PtySpawner, resolve_executable_path};
use build_agent_session::{SessionConfig, SessionRegistry, event::DEFAULT_FEED_CAPACITY};
use build_agent_transport::{AppState, AttachPaths, create_router};
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub use callback::CallbackConfig;

/// Server error.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Shell `{0}` not found")]
    ShellNotFound(String),
    #[error("Cannot create status callback client: {0}")]
    Callback(#[from] ClientError),
    #[error("Server failed: {0}")]
    Serve(#[source] io::Error),
    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Host name or address to listen on.
    pub bind: String,
    /// Port to listen on, `0` picks a free one.
    pub port: u16,
    pub session: SessionConfig,
    pub paths: AttachPaths,
    /// Shell running the commands, by name or absolute path. Platform
    /// default when unset.
    pub shell: Option<String>,
    /// Working directory of spawned tasks. Inherited when unset.
    pub working_dir: Option<PathBuf>,
    pub status_callback: Option<CallbackConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "localhost".to_string(),
            port: 8080,
            session: SessionConfig::default(),
            paths: AttachPaths::default(),
            shell: None,
            working_dir: None,
            status_callback: None,
        }
    }
}

/// A running agent.
pub struct AgentServer {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    shutdown: oneshot::Sender<()>,
    serve: JoinHandle<io::Result<()>>,
}

impl AgentServer {
    /// Bind the listener and start serving in the background.
    ///
    /// # Errors
    /// Returns error if the shell cannot be found, the callback client
    /// cannot be built or the address cannot be bound.
    pub async fn start(config: AgentConfig) -> Result<Self, ServerError> {
        let spawner = Arc::new(build_spawner(&config).await?);

        let registry = match config.status_callback {
            Some(target) => {
                let client = BoundedRetryingClient::new(target.retry)?;
                let (registry, events) =
                    SessionRegistry::with_event_feed(config.session, spawner, DEFAULT_FEED_CAPACITY);
                tokio::spawn(callback::forward_status(client, target.url, events));
                registry
            }
            None => SessionRegistry::new(config.session, spawner),
        };

        let addr = format!("{}:{}", config.bind, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let app = create_router(AppState::new(registry.clone(), config.paths));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tracing::info!(%local_addr, "Build agent listening");
        Ok(Self {
            local_addr,
            registry,
            shutdown,
            serve,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Kill running tasks, close every observer and stop serving.
    ///
    /// # Errors
    /// Returns error if the server loop failed.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.registry.shutdown().await;
        let _ = self.shutdown.send(());
        self.serve.await?.map_err(ServerError::Serve)?;
        tracing::info!("Build agent stopped");
        Ok(())
    }
}

async fn build_spawner(config: &AgentConfig) -> Result<PtySpawner, ServerError> {
    let mut spawner = PtySpawner::new();
    if let Some(shell) = &config.shell {
        let path = resolve_executable_path(shell)
            .await
            .ok_or_else(|| ServerError::ShellNotFound(shell.clone()))?;
        spawner = spawner.with_shell(path);
    }
    if let Some(dir) = &config.working_dir {
        spawner = spawner.working_dir(dir.clone());
    }
    tracing::debug!(shell = %spawner.shell().display(), "Using shell");
    Ok(spawner)
}
