use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the server search starts from when none is configured.
pub const DEFAULT_PORT: u16 = 8001;

/// Line fragment uvicorn prints on stderr once it accepts connections.
pub const DEFAULT_READY_SIGNAL: &str = "Uvicorn running";

/// Maximum number of entries kept per log channel.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Who may connect to the supervised server.
///
/// The mode is a launch argument, so changing it means a full restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessControl {
    /// Bind to localhost only
    #[default]
    LocalOnly,
    /// Bind to all interfaces
    NetworkExposed,
}

impl fmt::Display for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessControl::LocalOnly => write!(f, "local-only"),
            AccessControl::NetworkExposed => write!(f, "network-exposed"),
        }
    }
}

/// Numeric safety limits passed to the server as `--setting` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Maximum time a SQL query may run
    pub sql_time_limit_ms: u64,
    /// Maximum rows returned by a query
    pub max_returned_rows: u64,
    /// Time budget for computing facets
    pub facet_time_limit_ms: u64,
    /// CSV export size limit, 0 disables it
    pub max_csv_mb: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            sql_time_limit_ms: 10_000,
            max_returned_rows: 2_000,
            facet_time_limit_ms: 1_000,
            max_csv_mb: 0,
        }
    }
}

impl ServerSettings {
    /// The settings as `(name, value)` pairs in launch order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sql_time_limit_ms", self.sql_time_limit_ms.to_string()),
            ("max_returned_rows", self.max_returned_rows.to_string()),
            ("facet_time_limit_ms", self.facet_time_limit_ms.to_string()),
            ("max_csv_mb", self.max_csv_mb.to_string()),
        ]
    }
}

/// Settings for the optional log viewer HTTP service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogViewerConfig {
    /// Address to bind to
    #[serde(default = "default_viewer_address")]
    pub address: String,
    /// Port to listen on, 0 picks a free one
    #[serde(default)]
    pub port: u16,
    /// Bearer token required by every request
    pub token: Option<String>,
}

/// Interpreters tried when the configuration does not list any.
///
/// Copies bundled next to the executable come first (a packaged app's
/// `Resources` directory, then a development checkout), followed by common
/// system locations.
pub fn default_interpreter_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join("../Resources/python/bin/python3.9"));
        candidates.push(exe_dir.join("python/bin/python3.9"));
    }
    candidates.extend(
        [
            "/usr/local/bin/python3.9",
            "/usr/local/bin/python3",
            "/opt/homebrew/bin/python3",
            "/usr/bin/python3",
        ]
        .into_iter()
        .map(PathBuf::from),
    );
    candidates
}

fn default_viewer_address() -> String {
    "127.0.0.1".to_string()
}

/// Main configuration for the app runner.
///
/// Every field has a default, so an empty JSON object is a valid
/// configuration.
///
/// # JSON Schema
///
/// ```json
/// {
///   "appDir": "/home/me/.datasette-app",
///   "port": 8001,
///   "accessControl": "local-only",
///   "versionNote": "xyz-for-datasette-app",
///   "settings": { "sqlTimeLimitMs": 10000, "maxReturnedRows": 2000 },
///   "requirements": { "datasette": "0.59a2" },
///   "defaultPlugins": ["datasette-vega"],
///   "interpreterCandidates": ["/opt/python/bin/python3.9"],
///   "readySignal": "Uvicorn running",
///   "startupTimeoutSecs": 120,
///   "logCapacity": 1000,
///   "logViewer": { "port": 0, "token": "secret" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// User-scoped directory holding the runtime and backup artifacts
    pub app_dir: Option<PathBuf>,
    /// Fixed server port; when absent a free port is searched from 8001
    pub port: Option<u16>,
    /// Initial access-control mode
    pub access_control: AccessControl,
    /// Value for `--version-note`
    pub version_note: String,
    /// Safety limits
    pub settings: ServerSettings,
    /// Package name to minimum version
    pub requirements: BTreeMap<String, String>,
    /// Plugins enabled by default in the server
    pub default_plugins: Vec<String>,
    /// Interpreters tried, in order, when creating the runtime
    pub interpreter_candidates: Vec<PathBuf>,
    /// Stderr fragment that marks the server as ready
    pub ready_signal: String,
    /// Give up waiting for the ready signal after this many seconds
    pub startup_timeout_secs: Option<u64>,
    /// Entries kept per log channel
    pub log_capacity: usize,
    /// Log viewer service, disabled when absent
    pub log_viewer: Option<LogViewerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut requirements = BTreeMap::new();
        requirements.insert("datasette".to_string(), "0.59a2".to_string());
        requirements.insert("datasette-app-support".to_string(), "0.5".to_string());

        Self {
            app_dir: None,
            port: None,
            access_control: AccessControl::default(),
            version_note: "xyz-for-datasette-app".to_string(),
            settings: ServerSettings::default(),
            requirements,
            default_plugins: Vec::new(),
            interpreter_candidates: default_interpreter_candidates(),
            ready_signal: DEFAULT_READY_SIGNAL.to_string(),
            startup_timeout_secs: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_viewer: None,
        }
    }
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON
    /// * The JSON does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        Self::parse_from_str(&content)
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// The app directory, falling back to `~/.datasette-app`.
    pub fn resolved_app_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.app_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".datasette-app"))
            .ok_or_else(|| {
                Error::ConfigInvalid("Cannot determine home directory for appDir".to_string())
            })
    }

    /// Startup timeout as a `Duration`, if one is configured.
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_secs.map(Duration::from_secs)
    }
}
