// src/server/process.rs
use crate::error::{Error, Result};
use crate::logs::{LogAggregator, LogKind};
use crate::server::helper::decode_line;
use async_process::{Child, Command, Stdio};
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Unique identifier for one spawned server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(Uuid);

impl ServerId {
    // Private constructor, only usable within our crate
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to launch the server binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Server executable
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables, added to the inherited environment
    pub env: Vec<(String, String)>,
    /// Stderr fragment that promotes the instance to ready
    pub ready_signal: String,
}

/// How a server process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// The supervisor asked it to stop
    Requested {
        /// Exit code, if the platform reported one
        code: Option<i32>,
    },
    /// It exited on its own
    Unexpected {
        /// Exit code, if the platform reported one
        code: Option<i32>,
        /// Human-readable status
        description: String,
    },
}

enum Wake {
    Exited(std::io::Result<std::process::ExitStatus>),
    KillRequested,
}

/// A spawned server process.
///
/// A background watcher task owns the OS child: it waits for either the
/// process to exit or a kill request, and publishes an [`ExitReport`].
/// Dropping a `ServerProcess` kills the child.
pub struct ServerProcess {
    id: ServerId,
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    ready_rx: Option<oneshot::Receiver<()>>,
    ready: bool,
}

impl ServerProcess {
    /// Spawn the server and start capturing its output into `logs.server()`.
    ///
    /// `on_unexpected_exit` runs on the watcher task if the process exits
    /// without a prior [`terminate`](Self::terminate) call.
    pub fn spawn<F>(spec: &LaunchSpec, logs: Arc<LogAggregator>, on_unexpected_exit: F) -> Result<Self>
    where
        F: FnOnce(ServerId, &ExitReport) + Send + 'static,
    {
        let id = ServerId::new();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            logs.server().log(
                LogKind::Error,
                &format!("Failed to start {}: {}", spec.program.display(), e),
            );
            Error::Spawn(format!("{}: {}", spec.program.display(), e))
        })?;
        let pid = child.id();
        tracing::info!(server_id = %id, pid, program = %spec.program.display(), "Spawned server process");

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Spawn("Failed to get stdout pipe from child process".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            Error::Spawn("Failed to get stderr pipe from child process".to_string())
        })?;

        // stderr carries both uvicorn's log and the readiness line
        let (ready_tx, ready_rx) = oneshot::channel();
        let signal = spec.ready_signal.clone();
        let stderr_logs = Arc::clone(&logs);
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stderr).split(b'\n');
            while let Some(Ok(raw)) = lines.next().await {
                let line = decode_line(&raw);
                stderr_logs.server().log(LogKind::Stderr, &line);
                if ready_tx.is_some() && line.contains(&signal) {
                    if let Some(tx) = ready_tx.take() {
                        tracing::debug!(server_id = %id, "Ready signal observed");
                        let _ = tx.send(());
                    }
                }
            }
        });

        let stdout_logs = Arc::clone(&logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).split(b'\n');
            while let Some(Ok(raw)) = lines.next().await {
                let line = decode_line(&raw);
                stdout_logs.server().log(LogKind::Stdout, &line);
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_child(id, child, kill_rx, exit_tx, logs, on_unexpected_exit));

        Ok(Self {
            id,
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
            ready_rx: Some(ready_rx),
            ready: false,
        })
    }

    /// Get the instance ID
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// OS process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has already exited
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the ready signal shows up on stderr.
    ///
    /// There is no internal timeout. Fails if stderr closes first, which
    /// means the process died before it accepted connections.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let rx = self.ready_rx.take().ok_or_else(|| {
            Error::Spawn("Server exited before accepting connections".to_string())
        })?;
        rx.await.map_err(|_| {
            Error::Spawn("Server exited before accepting connections".to_string())
        })?;
        self.ready = true;
        Ok(())
    }

    /// Kill the process and wait for it to be reaped.
    pub async fn terminate(&mut self) -> Result<ExitReport> {
        if let Some(tx) = self.kill_tx.take() {
            // Fails only when the watcher already saw the process exit
            let _ = tx.send(());
        }
        let exit = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Process("Process watcher ended without a report".to_string()))?;
        match &*exit {
            Some(report) => Ok(report.clone()),
            None => Err(Error::Process("Process exit was not reported".to_string())),
        }
    }
}

impl fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("ready", &self.ready)
            .field("exited", &self.has_exited())
            .finish()
    }
}

async fn watch_child<F>(
    id: ServerId,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    logs: Arc<LogAggregator>,
    on_unexpected_exit: F,
) where
    F: FnOnce(ServerId, &ExitReport),
{
    // A dropped sender also counts as a kill request
    let wake = tokio::select! {
        status = child.status() => Wake::Exited(status),
        _ = kill_rx => Wake::KillRequested,
    };

    let report = match wake {
        Wake::KillRequested => {
            if let Err(e) = child.kill() {
                tracing::debug!(server_id = %id, error = %e, "Kill failed, process likely gone");
            }
            let code = child.status().await.ok().and_then(|s| s.code());
            tracing::info!(server_id = %id, ?code, "Server process stopped");
            ExitReport::Requested { code }
        }
        Wake::Exited(status) => {
            let (code, description) = match status {
                Ok(status) => (status.code(), status.to_string()),
                Err(e) => (None, format!("wait failed: {}", e)),
            };
            tracing::error!(server_id = %id, ?code, "Server process exited unexpectedly");
            logs.server().log(
                LogKind::Error,
                &format!("Server exited unexpectedly ({})", description),
            );
            let report = ExitReport::Unexpected { code, description };
            on_unexpected_exit(id, &report);
            report
        }
    };

    let _ = exit_tx.send(Some(report));
}
