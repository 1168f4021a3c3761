use crate::config::{AccessControl, Config};
use crate::continuity::{BackupArtifact, ContinuityManager};
use crate::environment::{PackageRequirement, Provision, RuntimeRoot};
use crate::error::{Error, Result};
use crate::logs::{LogAggregator, LogKind};
use crate::server::helper::{HelperOutput, HelperRunner};
use crate::server::lifecycle::{Notice, NoticeLevel, ServerEndpoint, ServerStatus, StopReason};
use crate::server::process::{ExitReport, LaunchSpec, ServerId, ServerProcess};
use crate::client::ApiClient;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Environment variable carrying the bearer token
pub const API_TOKEN_ENV: &str = "DATASETTE_API_TOKEN";
/// Environment variable carrying the process-wide signing secret
pub const SECRET_ENV: &str = "DATASETTE_SECRET";
/// Environment variable carrying the space-separated default plugins
pub const DEFAULT_PLUGINS_ENV: &str = "DATASETTE_DEFAULT_PLUGINS";

const NOTICE_BUFFER: usize = 16;

type CycleResult = Option<Result<ServerEndpoint>>;

/// Single-flight guard for start and restart cycles
enum Flight {
    Idle,
    Starting(watch::Receiver<CycleResult>),
    Restarting(watch::Receiver<CycleResult>),
}

impl Flight {
    fn pending(&self) -> Option<watch::Receiver<CycleResult>> {
        match self {
            Flight::Idle => None,
            Flight::Starting(rx) | Flight::Restarting(rx) => Some(rx.clone()),
        }
    }
}

struct Control {
    flight: Flight,
    access: AccessControl,
    runtime: Option<RuntimeRoot>,
}

struct Inner {
    config: Config,
    port: u16,
    token: String,
    secret: String,
    provisioner: Arc<dyn Provision>,
    continuity: ContinuityManager,
    helper: HelperRunner,
    logs: Arc<LogAggregator>,
    control: Mutex<Control>,
    // Held for the whole cycle; the only place a process handle lives
    instance: tokio::sync::Mutex<Option<ServerProcess>>,
    current: watch::Sender<Option<ServerEndpoint>>,
    status: watch::Sender<ServerStatus>,
    notices: broadcast::Sender<Notice>,
}

/// Owns the one supervised server process.
///
/// All transitions go through [`start_or_restart`](Self::start_or_restart),
/// which runs at most one provisioning/launch cycle at a time. Callers
/// arriving while a cycle is in flight join it and receive the same result.
/// The cycle itself runs on a spawned task, so dropping a caller never
/// cancels a half-finished restart.
///
/// Other components observe the supervisor through read-only views:
/// [`watch_endpoint`](Self::watch_endpoint), [`watch_status`](Self::watch_status)
/// and [`subscribe_notices`](Self::subscribe_notices).
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor for a server listening on `port`.
    ///
    /// A fresh bearer token and signing secret are generated here and kept
    /// for the lifetime of the supervisor, across restarts.
    pub fn new(
        config: Config,
        port: u16,
        provisioner: Arc<dyn Provision>,
        logs: Arc<LogAggregator>,
    ) -> Result<Self> {
        let app_dir = config.resolved_app_dir()?;
        let continuity = ContinuityManager::new(ApiClient::new()?, app_dir, Arc::clone(&logs));
        let (current, _) = watch::channel(None);
        let (status, _) = watch::channel(ServerStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let inner = Inner {
            port,
            token: random_secret(),
            secret: random_secret(),
            provisioner,
            continuity,
            helper: HelperRunner::new(Arc::clone(&logs)),
            logs,
            control: Mutex::new(Control {
                flight: Flight::Idle,
                access: config.access_control,
                runtime: None,
            }),
            instance: tokio::sync::Mutex::new(None),
            current,
            status,
            notices,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start the server, or restart it if one is running.
    ///
    /// Resolves once the new instance printed its ready signal and any
    /// saved state was restored. Fatal errors ([`Error::is_fatal`]) leave
    /// the supervisor in `Stopped(Failed)`.
    pub async fn start_or_restart(&self) -> Result<ServerEndpoint> {
        let mut rx = self.inner.begin_or_join();
        wait_for_cycle(&mut rx).await
    }

    /// Switch the access-control mode, restarting if it changed.
    pub async fn set_access_control(&self, mode: AccessControl) -> Result<()> {
        self.settle().await;
        {
            let mut control = self.inner.control();
            if control.access == mode {
                tracing::debug!(%mode, "Access control unchanged");
                return Ok(());
            }
            tracing::info!(from = %control.access, to = %mode, "Changing access control");
            control.access = mode;
        }
        self.start_or_restart().await.map(|_| ())
    }

    /// Install a plugin into the runtime, then restart the server.
    ///
    /// Installer failures are returned as [`Error::HelperCommand`] and the
    /// running server is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn install_plugin(&self, name: &str) -> Result<ServerEndpoint> {
        let root = self.runtime_root().ok_or(Error::NotRunning)?;
        self.inner
            .helper
            .run(
                root.pip(),
                ["install", "--disable-pip-version-check", "--no-input", name],
            )
            .await?;
        self.settle().await;
        self.start_or_restart().await
    }

    /// Remove a plugin from the runtime, then restart the server.
    #[tracing::instrument(skip(self))]
    pub async fn uninstall_plugin(&self, name: &str) -> Result<ServerEndpoint> {
        let root = self.runtime_root().ok_or(Error::NotRunning)?;
        self.inner
            .helper
            .run(root.pip(), ["uninstall", "-y", name])
            .await?;
        self.settle().await;
        self.start_or_restart().await
    }

    /// Run a short-lived helper command, logging into the process channel.
    pub async fn run_helper_command<I, S>(&self, program: impl AsRef<Path>, args: I) -> Result<HelperOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.helper.run(program, args).await
    }

    /// Stop the running server.
    ///
    /// Waits for an in-flight cycle first. Returns [`Error::NotRunning`]
    /// if there is nothing to stop.
    #[tracing::instrument(skip(self), fields(port = self.inner.port))]
    pub async fn shutdown(&self) -> Result<()> {
        self.settle().await;
        let mut slot = self.inner.instance.lock().await;
        let mut process = slot.take().ok_or(Error::NotRunning)?;

        self.inner.current.send_replace(None);
        let report = process.terminate().await?;
        tracing::info!(server_id = %process.id(), ?report, "Server shut down");
        self.inner
            .logs
            .server()
            .log(LogKind::End, &format!("Server {} shut down", process.id()));
        self.inner
            .status
            .send_replace(ServerStatus::Stopped(StopReason::Shutdown));
        Ok(())
    }

    /// Current state of the state machine
    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    /// Receiver notified on every status transition
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    /// Endpoint of the ready instance, if any
    pub fn endpoint(&self) -> Option<ServerEndpoint> {
        self.inner.current.borrow().clone()
    }

    /// Receiver notified whenever an instance is published or torn down
    pub fn watch_endpoint(&self) -> watch::Receiver<Option<ServerEndpoint>> {
        self.inner.current.subscribe()
    }

    /// The ready endpoint, joining an in-flight cycle if there is one.
    pub async fn ready_endpoint(&self) -> Result<ServerEndpoint> {
        let pending = self.inner.control().flight.pending();
        if let Some(mut rx) = pending {
            return wait_for_cycle(&mut rx).await;
        }
        self.endpoint().ok_or(Error::NotRunning)
    }

    /// Non-fatal problems for the UI to display
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Access mode used by the next launch
    pub fn access_control(&self) -> AccessControl {
        self.inner.control().access
    }

    /// Port every instance listens on
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Runtime resolved by the last cycle
    pub fn runtime_root(&self) -> Option<RuntimeRoot> {
        self.inner.control().runtime.clone()
    }

    /// The log aggregator this supervisor writes to
    pub fn logs(&self) -> &Arc<LogAggregator> {
        &self.inner.logs
    }

    /// Arguments the next launch will use
    pub fn server_args(&self) -> Vec<String> {
        self.inner.launch_args(self.access_control())
    }

    /// Shell line reproducing the server launch, token included.
    ///
    /// `None` until a runtime has been provisioned.
    pub fn command_line(&self) -> Option<String> {
        let root = self.runtime_root()?;
        Some(format!(
            "{}={} {} {}",
            API_TOKEN_ENV,
            self.inner.token,
            root.server_binary().display(),
            self.server_args().join(" ")
        ))
    }

    async fn settle(&self) {
        let pending = self.inner.control().flight.pending();
        if let Some(mut rx) = pending {
            tracing::debug!("Waiting for in-flight cycle to settle");
            let _ = rx.wait_for(Option::is_some).await;
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("port", &self.inner.port)
            .field("status", &self.status())
            .field("access", &self.access_control())
            .finish()
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_or_join(self: &Arc<Self>) -> watch::Receiver<CycleResult> {
        let mut control = self.control();
        if let Some(rx) = control.flight.pending() {
            // A closed sender means the cycle task died without reporting
            if rx.has_changed().is_ok() {
                tracing::debug!("Joining in-flight cycle");
                return rx;
            }
            tracing::warn!("Previous cycle ended without a result, starting over");
        }

        let restarting = self.status.borrow().is_ready();
        let (tx, rx) = watch::channel(None);
        if restarting {
            control.flight = Flight::Restarting(rx.clone());
            self.status.send_replace(ServerStatus::Restarting);
        } else {
            control.flight = Flight::Starting(rx.clone());
            self.status.send_replace(ServerStatus::Starting);
        }
        drop(control);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.run_cycle().await;
            // Back to Idle before publishing, so a woken waiter can begin a
            // fresh cycle instead of joining this one
            inner.control().flight = Flight::Idle;
            let _ = tx.send(Some(result));
        });
        rx
    }

    #[tracing::instrument(skip(self), fields(port = self.port))]
    async fn run_cycle(self: &Arc<Self>) -> Result<ServerEndpoint> {
        let mut slot = self.instance.lock().await;

        let root = match self.provisioner.ensure_environment().await {
            Ok(root) => root,
            Err(e) => return Err(self.fail(e)),
        };
        let requirements = PackageRequirement::from_map(&self.config.requirements);
        if let Err(e) = self
            .provisioner
            .ensure_packages_installed(&root, &requirements)
            .await
        {
            tracing::warn!(error = %e, "Package installation failed, launching anyway");
            self.logs.process().log(LogKind::Error, &e.to_string());
            self.notify(Notice::new(
                NoticeLevel::Warning,
                "Package installation failed",
                e.to_string(),
            ));
        }
        self.control().runtime = Some(root.clone());

        let artifact = match slot.take() {
            Some(old) => self.retire(old).await,
            None => None,
        };

        let access = self.control().access;
        let spec = LaunchSpec {
            program: root.server_binary(),
            args: self.launch_args(access),
            env: self.launch_env(),
            ready_signal: self.config.ready_signal.clone(),
        };
        self.logs.server().log(
            LogKind::Start,
            &format!(
                "Starting {} {}",
                spec.program.display(),
                spec.args.join(" ")
            ),
        );

        let weak = Arc::downgrade(self);
        let spawned = ServerProcess::spawn(&spec, Arc::clone(&self.logs), move |id, report| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_unexpected_exit(id, report);
            }
        });
        let mut process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.discard(artifact).await;
                return Err(self.fail(e));
            }
        };

        let ready = match self.config.startup_timeout() {
            Some(limit) => tokio::time::timeout(limit, process.wait_until_ready())
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "No ready signal within {}s",
                        limit.as_secs()
                    )))
                }),
            None => process.wait_until_ready().await,
        };
        if let Err(e) = ready {
            if let Err(kill_err) = process.terminate().await {
                tracing::warn!(error = %kill_err, "Failed to stop server after failed start");
            }
            self.discard(artifact).await;
            return Err(self.fail(e));
        }

        let endpoint = ServerEndpoint {
            instance: process.id(),
            port: self.port,
            token: self.token.clone(),
            access,
        };

        if let Some(artifact) = artifact {
            if let Err(e) = self.continuity.restore(&endpoint, artifact).await {
                tracing::warn!(error = %e, "State was not restored");
                self.notify(Notice::new(
                    NoticeLevel::Warning,
                    "Temporary data was not restored",
                    e.to_string(),
                ));
            }
        }

        if process.has_exited() {
            *slot = Some(process);
            return Err(self.exited_during_start());
        }

        tracing::info!(server_id = %endpoint.instance, pid = process.pid(), %access, "Server ready");
        *slot = Some(process);
        self.current.send_replace(Some(endpoint.clone()));
        self.status.send_replace(ServerStatus::Ready);
        Ok(endpoint)
    }

    /// Snapshot a superseded instance if it is still alive, then stop it.
    async fn retire(&self, mut old: ServerProcess) -> Option<BackupArtifact> {
        let endpoint = self.current.borrow().clone();
        let mut artifact = None;

        if !old.has_exited() {
            if let Some(endpoint) = endpoint.filter(|e| e.instance == old.id()) {
                match self.continuity.snapshot(&endpoint).await {
                    Ok(saved) => artifact = Some(saved),
                    Err(e) => {
                        tracing::warn!(error = %e, "Restarting without a snapshot");
                        self.logs.server().log(LogKind::Error, &e.to_string());
                        self.notify(Notice::new(
                            NoticeLevel::Warning,
                            "Temporary data could not be saved",
                            e.to_string(),
                        ));
                    }
                }
            }
        }

        self.current.send_replace(None);
        match old.terminate().await {
            Ok(report) => tracing::debug!(server_id = %old.id(), ?report, "Old instance stopped"),
            Err(e) => tracing::warn!(server_id = %old.id(), error = %e, "Old instance did not report exit"),
        }
        self.logs
            .server()
            .log(LogKind::End, &format!("Server {} stopped for restart", old.id()));
        artifact
    }

    async fn discard(&self, artifact: Option<BackupArtifact>) {
        if let Some(artifact) = artifact {
            self.continuity.discard(artifact).await;
        }
    }

    fn fail(&self, e: Error) -> Error {
        tracing::error!(error = %e, fatal = e.is_fatal(), "Start cycle failed");
        self.logs.server().log(LogKind::Error, &e.to_string());
        self.status
            .send_replace(ServerStatus::Stopped(StopReason::Failed));
        e
    }

    /// The instance printed its ready signal but died before being published.
    fn exited_during_start(&self) -> Error {
        let e = self.fail(Error::Process(
            "Server exited right after becoming ready".to_string(),
        ));
        self.status
            .send_replace(ServerStatus::Stopped(StopReason::Crashed));
        self.notify(Notice::new(NoticeLevel::Error, "Datasette stopped", e.to_string()));
        e
    }

    fn notify(&self, notice: Notice) {
        // No receivers is normal for headless use
        let _ = self.notices.send(notice);
    }

    fn handle_unexpected_exit(&self, id: ServerId, report: &ExitReport) {
        let was_current = self.current.send_if_modified(|current| match current {
            Some(endpoint) if endpoint.instance == id => {
                *current = None;
                true
            }
            _ => false,
        });
        if !was_current {
            return;
        }

        self.status.send_if_modified(|status| {
            if status.is_ready() {
                *status = ServerStatus::Stopped(StopReason::Crashed);
                true
            } else {
                false
            }
        });
        let detail = match report {
            ExitReport::Unexpected { description, .. } => description.clone(),
            ExitReport::Requested { code } => format!("exit code {:?}", code),
        };
        self.notify(Notice::new(NoticeLevel::Error, "Datasette stopped", detail));
    }

    fn launch_args(&self, access: AccessControl) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.port.to_string(),
            "--version-note".to_string(),
            self.config.version_note.clone(),
        ];
        for (name, value) in self.config.settings.pairs() {
            args.push("--setting".to_string());
            args.push(name.to_string());
            args.push(value);
        }
        if access == AccessControl::NetworkExposed {
            args.push("--host".to_string());
            args.push("0.0.0.0".to_string());
        }
        args
    }

    fn launch_env(&self) -> Vec<(String, String)> {
        vec![
            (API_TOKEN_ENV.to_string(), self.token.clone()),
            (SECRET_ENV.to_string(), self.secret.clone()),
            (
                DEFAULT_PLUGINS_ENV.to_string(),
                self.config.default_plugins.join(" "),
            ),
        ]
    }
}

async fn wait_for_cycle(rx: &mut watch::Receiver<CycleResult>) -> Result<ServerEndpoint> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| Error::Process("Start cycle ended without a result".to_string()))?;
    let result = match &*outcome {
        Some(result) => result.clone(),
        None => Err(Error::Process("Start cycle result missing".to_string())),
    };
    result
}

fn random_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// First port at or above `start` that can be bound on localhost
pub async fn find_free_port(start: u16) -> Result<u16> {
    for port in start..=u16::MAX {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            tracing::debug!(port, "Found free port");
            return Ok(port);
        }
    }
    Err(Error::Other(format!("No free port at or above {}", start)))
}
