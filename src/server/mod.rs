/// Server management module for the Datasette app runner.
///
/// This module owns the supervised server process: launching it, watching
/// for its ready signal, restarting it with state preserved, noticing when
/// it crashes, and running short-lived helper commands next to it.
/// All public async entry points are instrumented with `tracing` spans.
///
/// # Components
///
/// * `lifecycle` - Status, endpoint and notice types shared with observers
/// * `helper` - Short-lived helper commands logged into the process channel
/// * `process` - One spawned server instance and its watcher task
/// * `supervisor` - Single-flight start/restart state machine
///
/// # Examples
///
/// Watching status transitions:
///
/// ```no_run
/// use datasette_app_runner::config::Config;
/// use datasette_app_runner::environment::EnvironmentProvisioner;
/// use datasette_app_runner::logs::LogAggregator;
/// use datasette_app_runner::server::{HelperRunner, Supervisor};
/// use std::sync::Arc;
///
/// # async fn run() -> datasette_app_runner::error::Result<()> {
/// let config = Config::default();
/// let logs = Arc::new(LogAggregator::new(config.log_capacity));
/// let provisioner = EnvironmentProvisioner::new(
///     config.resolved_app_dir()?,
///     config.interpreter_candidates.clone(),
///     HelperRunner::new(Arc::clone(&logs)),
/// );
/// let supervisor = Supervisor::new(config, 8001, Arc::new(provisioner), logs)?;
///
/// let mut status = supervisor.watch_status();
/// tokio::spawn(async move {
///     while status.changed().await.is_ok() {
///         println!("server is {}", *status.borrow());
///     }
/// });
///
/// let endpoint = supervisor.start_or_restart().await?;
/// println!("listening on {}", endpoint.base_url());
/// # Ok(())
/// # }
/// ```
pub mod helper;
pub mod lifecycle;
mod process;
mod supervisor;

pub use helper::{HelperOutput, HelperRunner};
pub use lifecycle::{Notice, NoticeLevel, ServerEndpoint, ServerStatus, StopReason};
pub use process::{ExitReport, LaunchSpec, ServerId, ServerProcess};
pub use supervisor::{
    API_TOKEN_ENV, DEFAULT_PLUGINS_ENV, SECRET_ENV, Supervisor, find_free_port,
};
