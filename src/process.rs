use crate::config::BackendConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Extra time granted to the watcher task on top of the kill timeout
const KILL_JOIN_SLACK: Duration = Duration::from_millis(500);

/// Lifecycle of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChildState {
    /// `start` has not been called
    NotStarted,
    /// Process is running
    Running { pid: u32 },
    /// The process could not be spawned
    SpawnFailed,
    /// The process exited on its own; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// The process was killed during shutdown
    Killed,
}

/// A spawned child together with the task that waits on it
struct SupervisedChild {
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

/// Owns the backend process for the lifetime of the front-end.
///
/// The child is launched once by [`start`](BackendSupervisor::start) and is
/// never restarted. [`kill`](BackendSupervisor::kill) may be called any number
/// of times; only the first call with a live child does anything, and it
/// waits for the child at most `kill_timeout_ms` (plus a small slack).
///
/// ```ignore
/// let mut supervisor = BackendSupervisor::new(config.backend.clone());
/// supervisor.start();
/// // ... serve until a signal arrives ...
/// supervisor.kill().await;
/// ```
pub struct BackendSupervisor {
    config: BackendConfig,
    child: Option<SupervisedChild>,
    state_tx: watch::Sender<ChildState>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig) -> Self {
        let (state_tx, _) = watch::channel(ChildState::NotStarted);
        Self {
            config,
            child: None,
            state_tx,
        }
    }

    /// Current state of the backend
    pub fn state(&self) -> ChildState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ChildState> {
        self.state_tx.subscribe()
    }

    /// PID of the spawned child, if one was spawned
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.pid)
    }

    /// Spawn the backend.
    ///
    /// Spawn failures are logged and recorded as [`ChildState::SpawnFailed`];
    /// they are not returned, the front-end keeps serving without a backend.
    /// Returns true when a child is running afterwards.
    pub fn start(&mut self) -> bool {
        if self.state() != ChildState::NotStarted {
            warn!(state = ?self.state(), "Backend already started once, not starting again");
            return self.child.is_some();
        }

        match self.spawn() {
            Ok(child) => {
                let pid = child.id();
                let (kill_tx, kill_rx) = oneshot::channel();
                if let Some(pid) = pid {
                    self.state_tx.send_replace(ChildState::Running { pid });
                }

                let watcher = tokio::spawn(watch_child(
                    child,
                    kill_rx,
                    self.state_tx.clone(),
                    self.config.kill_timeout(),
                ));

                self.child = Some(SupervisedChild {
                    pid,
                    kill_tx,
                    watcher,
                });
                true
            }
            Err(e) => {
                error!(command = %self.config.command, error = %e, "Failed to start backend");
                self.state_tx.send_replace(ChildState::SpawnFailed);
                false
            }
        }
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let (program, args) = self.config.program_and_args()?;

        info!(command = %program, args = ?args, port = self.config.port, "Starting backend");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        // Backend output goes straight to the operator's terminal
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        // Without an explicit directory the child shares ours
        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        // Pin the backend port; never the front-end's PORT
        cmd.env("PORT", self.config.port.to_string());

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn '{}': {}", program, e))?;
        info!(pid = child.id().unwrap_or(0), "Backend process spawned");

        Ok(child)
    }

    /// Kill the backend if it is still running.
    ///
    /// Safe to call repeatedly and after the child already exited. Never waits
    /// longer than the configured kill timeout plus a short slack.
    pub async fn kill(&mut self) {
        let Some(supervised) = self.child.take() else {
            debug!("No backend process to kill");
            return;
        };

        // Fails only when the watcher already saw the child exit
        let _ = supervised.kill_tx.send(());

        let mut watcher = supervised.watcher;
        let limit = self.config.kill_timeout() + KILL_JOIN_SLACK;
        match tokio::time::timeout(limit, &mut watcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Backend watcher task failed"),
            Err(_) => {
                warn!(
                    pid = supervised.pid,
                    timeout_ms = limit.as_millis() as u64,
                    "Backend did not stop in time, abandoning it"
                );
                // Dropping the child inside the task sends SIGKILL again
                watcher.abort();
            }
        }
    }
}

/// Wait for the child to exit or for a kill request, whichever comes first.
///
/// A dropped `kill_rx` sender counts as a kill request so the child never
/// outlives its supervisor.
async fn watch_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ChildState>,
    kill_timeout: Duration,
) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => {
                    warn!(pid, code = ?status.code(), "Backend process exited");
                    status.code()
                }
                Err(e) => {
                    error!(pid, error = %e, "Error waiting for backend process");
                    None
                }
            };
            state_tx.send_replace(ChildState::Exited { code });
        }
        _ = kill_rx => {
            info!(pid, "Killing backend process");
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "Kill signal not delivered");
            }

            match tokio::time::timeout(kill_timeout, child.wait()).await {
                Ok(Ok(status)) => info!(pid, ?status, "Backend process stopped"),
                Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for killed backend"),
                Err(_) => warn!(
                    pid,
                    timeout_ms = kill_timeout.as_millis() as u64,
                    "Backend still running after kill"
                ),
            }
            state_tx.send_replace(ChildState::Killed);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_backend(script: &str) -> BackendConfig {
        BackendConfig::new("sh", vec!["-c".to_string(), script.to_string()], 8001)
    }

    async fn wait_for_state<F>(supervisor: &BackendSupervisor, f: F) -> ChildState
    where
        F: FnMut(&ChildState) -> bool,
    {
        let mut rx = supervisor.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("state change in time")
            .expect("sender alive");
        *state
    }

    #[test]
    fn test_initial_state() {
        let supervisor = BackendSupervisor::new(shell_backend("true"));
        assert_eq!(supervisor.state(), ChildState::NotStarted);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let mut supervisor = BackendSupervisor::new(BackendConfig::new(
            "/nonexistent/frontgate-backend",
            Vec::new(),
            8001,
        ));

        assert!(!supervisor.start());
        assert_eq!(supervisor.state(), ChildState::SpawnFailed);

        // Nothing to kill, must not hang or panic
        supervisor.kill().await;
        supervisor.kill().await;
        assert_eq!(supervisor.state(), ChildState::SpawnFailed);
    }

    #[tokio::test]
    async fn test_exit_code_tracked() {
        let mut supervisor = BackendSupervisor::new(shell_backend("exit 3"));
        assert!(supervisor.start());

        let state = wait_for_state(&supervisor, |s| matches!(s, ChildState::Exited { .. })).await;
        assert_eq!(state, ChildState::Exited { code: Some(3) });

        // Kill after exit is a no-op and keeps the exit state
        supervisor.kill().await;
        assert_eq!(supervisor.state(), ChildState::Exited { code: Some(3) });
    }

    #[tokio::test]
    async fn test_kill_running_backend() {
        let mut supervisor = BackendSupervisor::new(shell_backend("exec sleep 30"));
        assert!(supervisor.start());
        assert!(matches!(supervisor.state(), ChildState::Running { .. }));
        assert!(supervisor.pid().is_some());

        let started = std::time::Instant::now();
        supervisor.kill().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(supervisor.state(), ChildState::Killed);
        assert!(supervisor.pid().is_none());

        // Second kill does nothing
        supervisor.kill().await;
        assert_eq!(supervisor.state(), ChildState::Killed);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let mut supervisor = BackendSupervisor::new(shell_backend("exec sleep 30"));
        assert!(supervisor.start());
        let pid = supervisor.pid();

        assert!(supervisor.start());
        assert_eq!(supervisor.pid(), pid);

        supervisor.kill().await;
        assert!(!supervisor.start());
    }

    #[tokio::test]
    async fn test_port_and_env_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = std::collections::HashMap::new();
        env.insert("PORT".to_string(), "3000".to_string());
        env.insert("APP_MODE".to_string(), "test".to_string());

        let config = shell_backend("echo \"$PORT $APP_MODE\" > out.txt")
            .with_working_dir(dir.path())
            .with_env(env);
        let mut supervisor = BackendSupervisor::new(config);
        assert!(supervisor.start());

        let state = wait_for_state(&supervisor, |s| matches!(s, ChildState::Exited { .. })).await;
        assert_eq!(state, ChildState::Exited { code: Some(0) });

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "8001 test");
    }

    #[tokio::test]
    async fn test_command_line_string() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::new("sh -c 'touch started'", Vec::new(), 8001)
            .with_working_dir(dir.path());
        let mut supervisor = BackendSupervisor::new(config);
        assert!(supervisor.start());

        wait_for_state(&supervisor, |s| matches!(s, ChildState::Exited { .. })).await;
        assert!(dir.path().join("started").exists());
    }

    #[test]
    fn test_child_state_serialization() {
        let json = serde_json::to_string(&ChildState::Running { pid: 42 }).unwrap();
        assert_eq!(json, r#"{"state":"running","pid":42}"#);
        let json = serde_json::to_string(&ChildState::Killed).unwrap();
        assert_eq!(json, r#"{"state":"killed"}"#);
    }
}
