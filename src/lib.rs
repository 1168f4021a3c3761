/*!
 # Datasette App Runner

 A Rust library for supervising a local Datasette server on behalf of a
 desktop shell.

 ## Overview

 Datasette App Runner provides functionality to:
 - Provision an isolated Python runtime and install the server into it
 - Start the server, detect when it is ready, and restart it on demand
 - Carry the temporary in-memory database across restarts
 - Open server pages in native windows through an authenticated handshake
 - Capture server and helper-command output into bounded, subscribable logs
 - Optionally serve those logs over HTTP and Server-Sent Events

 ## Basic Usage

 ```no_run
 use datasette_app_runner::{DatasetteApp, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Load configuration; every field has a default
     let app = DatasetteApp::from_config_file("datasette-app.json").await?;

     // Follow the server log
     app.logs().server().subscribe(|entry| println!("[{}] {}", entry.kind, entry.message));

     // Provision, launch and wait for the ready signal
     let endpoint = app.start().await?;
     println!("Datasette is at {}", endpoint.base_url());

     // Talk to the server's API
     println!("{}", app.about().await?);

     // Restarting keeps temporary data
     app.supervisor().start_or_restart().await?;

     Ok(())
 }
 ```

 ## Failure policy

 Provisioning and spawn failures are fatal ([`Error::is_fatal`]); the library
 reports them and leaves terminating to the embedding application. Package
 installation, snapshot and restore failures are published as
 [`server::Notice`]s and never stop the supervisor.
*/

pub mod client;
pub mod config;
pub mod continuity;
pub mod environment;
pub mod error;
pub mod log_viewer;
pub mod logs;
pub mod server;
pub mod session;

pub use client::ApiClient;
pub use config::Config;
pub use error::{Error, Result};
pub use logs::{LogAggregator, LogEntry, LogKind};
pub use server::{ServerEndpoint, ServerId, ServerStatus, Supervisor};

use config::{DEFAULT_PORT, LogViewerConfig, validate_config};
use environment::{EnvironmentProvisioner, Provision};
use log_viewer::{LogViewer, LogViewerHandle};
use server::{HelperRunner, find_free_port};
use session::{SessionGateway, WindowHost};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// Wires the supervisor, logs, API client and log viewer together
///
/// This struct is the main entry point for embedding the runner in a
/// desktop shell or a headless program.
/// All public constructors are instrumented with `tracing` spans.
pub struct DatasetteApp {
    /// Configuration
    config: Config,
    /// Both log channels
    logs: Arc<LogAggregator>,
    /// Owner of the server process
    supervisor: Supervisor,
    /// Client for the server's API
    client: ApiClient,
    /// Log viewer handle (if running)
    log_viewer: Option<LogViewerHandle>,
}

impl DatasetteApp {
    /// Create an app from a configuration file path
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub async fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        Self::new(config).await
    }

    /// Create an app from a configuration string
    #[tracing::instrument(skip(config))]
    pub async fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Self::new(config).await
    }

    /// Create an app with the virtual-environment provisioner.
    ///
    /// Without a configured port, the first free port from 8001 is used
    /// for the whole run.
    #[tracing::instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        validate_config(&config)?;
        let port = match config.port {
            Some(port) => port,
            None => find_free_port(DEFAULT_PORT).await?,
        };
        let logs = Arc::new(LogAggregator::new(config.log_capacity));
        let provisioner = EnvironmentProvisioner::new(
            config.resolved_app_dir()?,
            config.interpreter_candidates.clone(),
            HelperRunner::new(Arc::clone(&logs)),
        );
        Self::with_provisioner(config, port, logs, Arc::new(provisioner))
    }

    /// Create an app with a custom provisioning strategy
    pub fn with_provisioner(
        config: Config,
        port: u16,
        logs: Arc<LogAggregator>,
        provisioner: Arc<dyn Provision>,
    ) -> Result<Self> {
        validate_config(&config)?;
        tracing::info!(port, access = %config.access_control, "Creating DatasetteApp");
        let supervisor = Supervisor::new(config.clone(), port, provisioner, Arc::clone(&logs))?;
        Ok(Self {
            config,
            logs,
            supervisor,
            client: ApiClient::new()?,
            log_viewer: None,
        })
    }

    /// Provision, launch and wait for the server to be ready
    pub async fn start(&self) -> Result<ServerEndpoint> {
        self.supervisor.start_or_restart().await
    }

    /// The supervisor owning the server process
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Both log channels
    pub fn logs(&self) -> &Arc<LogAggregator> {
        &self.logs
    }

    /// Client for the server's API
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A session gateway driving `host`'s windows
    pub fn session_gateway(&self, host: Arc<dyn WindowHost>) -> Result<SessionGateway> {
        SessionGateway::new(host, self.supervisor.watch_endpoint())
    }

    /// Open a CSV or SQLite file, returning the path to show
    pub async fn open_file(&self, file: impl AsRef<Path>) -> Result<String> {
        let endpoint = self.supervisor.ready_endpoint().await?;
        self.client.open_file(&endpoint, file).await
    }

    /// Create and attach an empty database file
    pub async fn new_empty_database_file(&self, file: impl AsRef<Path>) -> Result<String> {
        let endpoint = self.supervisor.ready_endpoint().await?;
        self.client
            .new_empty_database_file(&endpoint, file.as_ref())
            .await
    }

    /// Import a CSV file into `database`
    pub async fn import_csv_file(&self, file: impl AsRef<Path>, database: &str) -> Result<String> {
        let endpoint = self.supervisor.ready_endpoint().await?;
        self.client
            .import_csv_file(&endpoint, file.as_ref(), database)
            .await
    }

    /// Version summary for an "About" dialog
    pub async fn about(&self) -> Result<String> {
        let endpoint = self.supervisor.ready_endpoint().await?;
        self.client.about(&endpoint).await
    }

    /// Start the log viewer using `logViewer` from the configuration, or
    /// an unauthenticated localhost viewer on a free port.
    pub async fn start_log_viewer(&mut self) -> Result<SocketAddr> {
        if let Some(handle) = &self.log_viewer {
            return Ok(handle.addr());
        }
        let viewer_config = self.config.log_viewer.clone().unwrap_or(LogViewerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            token: None,
        });
        let handle = LogViewer::start(Arc::clone(&self.logs), viewer_config).await?;
        let addr = handle.addr();
        self.log_viewer = Some(handle);
        Ok(addr)
    }

    /// Stop the log viewer and the server.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(viewer) = self.log_viewer.take() {
            viewer.stop().await;
        }
        match self.supervisor.shutdown().await {
            Ok(()) | Err(Error::NotRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for DatasetteApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetteApp")
            .field("supervisor", &self.supervisor)
            .field("log_viewer", &self.log_viewer)
            .finish()
    }
}
