//! Startup and shutdown sequence shared by both binaries

use crate::config::Config;
use crate::process::BackendSupervisor;
use crate::proxy::{ProxyServer, Router};
use crate::{PKG_NAME, VERSION};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// How long shutdown waits for the accept loop to wind down
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Deployment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Forward to a backend that is managed elsewhere
    Proxy,
    /// Spawn the backend as a child and kill it on shutdown
    Supervise,
}

impl Mode {
    pub fn supervises(&self) -> bool {
        *self == Mode::Supervise
    }
}

/// Initialize logging; `RUST_LOG` refines the default `frontgate=info`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontgate=info".parse().expect("valid log directive")),
        )
        .init();
}

/// SIGINT/SIGTERM listeners, installed before anything is spawned so an
/// early signal still goes through the shutdown path
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    pub fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> anyhow::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next termination signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        "Ctrl+C"
    }
}

/// Run the front-end until a termination signal arrives.
///
/// In [`Mode::Supervise`] the backend is spawned after the listener is bound
/// and killed before this returns.
pub async fn run(config: Config, mode: Mode) -> anyhow::Result<()> {
    config.validate(mode.supervises())?;

    let mut signals = ShutdownSignals::install()?;

    print_startup_banner(&config, mode);

    let bind_addr = config.server.socket_addr().map_err(|e| {
        error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address: {}", e)
    })?;

    let router = Router::from_config(&config)?;

    // Bind before spawning so a taken port never leaves an orphaned backend
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;

    let mut supervisor = if mode.supervises() {
        let mut supervisor = BackendSupervisor::new(config.backend.clone());
        supervisor.start();
        Some(supervisor)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(router, shutdown_rx);
    let mut server_handle = tokio::spawn(server.serve(listener));

    info!(port = config.server.port, "Server running");
    info!(url = %format!("http://localhost:{}", config.server.port), "Frontend");
    info!(url = %config.proxy.backend_url, prefix = %config.proxy.prefix, "Backend API");

    let outcome = tokio::select! {
        signal = signals.recv() => {
            info!(signal, "Signal received: closing HTTP server");
            Ok(())
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            }
        }
    };

    shutdown(shutdown_tx, supervisor.as_mut(), server_handle).await;
    outcome
}

/// Stop accepting, kill the backend if one is supervised, and give the
/// server task a bounded moment to finish
async fn shutdown(
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<&mut BackendSupervisor>,
    server_handle: tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let _ = shutdown_tx.send(true);

    if let Some(supervisor) = supervisor {
        info!("Stopping backend...");
        supervisor.kill().await;
    }

    if !server_handle.is_finished()
        && tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle)
            .await
            .is_err()
    {
        error!("Server did not stop in time");
    }

    info!("Shutdown complete");
}

fn print_startup_banner(config: &Config, mode: Mode) {
    info!(name = PKG_NAME, version = VERSION, ?mode, "Starting front-end server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        static_dir = %config.server.static_dir.display(),
        index_file = %config.server.index_file,
        "Server configuration"
    );
    info!(
        prefix = %config.proxy.prefix,
        backend_url = %config.proxy.backend_url,
        strip_prefix = config.proxy.strip_prefix,
        request_timeout_secs = config.proxy.request_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Proxy configuration"
    );
    if mode.supervises() {
        info!(
            command = %config.backend.command,
            args = ?config.backend.args,
            port = config.backend.port,
            working_dir = ?config.backend.working_dir,
            "Backend process configuration"
        );
    }
}
