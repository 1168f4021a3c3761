use crate::config::AccessControl;
use crate::server::ServerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the server is not running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// No start has been attempted yet
    NeverStarted,
    /// The last start attempt failed
    Failed,
    /// The process exited without being asked to
    Crashed,
    /// The supervisor shut it down
    Shutdown,
}

/// Supervisor state machine
///
/// `Stopped -> Starting -> Ready -> (Restarting -> Ready) | Stopped(Crashed) | Stopped(Shutdown)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum ServerStatus {
    /// No live instance
    Stopped(StopReason),
    /// First launch in progress
    Starting,
    /// A live instance is accepting connections
    Ready,
    /// Replacing an existing instance
    Restarting,
}

impl ServerStatus {
    /// Whether an instance is accepting connections
    pub fn is_ready(&self) -> bool {
        matches!(self, ServerStatus::Ready)
    }

    /// Whether a start or restart cycle is running
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Restarting)
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus::Stopped(StopReason::NeverStarted)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped(reason) => write!(f, "stopped ({:?})", reason),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Ready => write!(f, "ready"),
            ServerStatus::Restarting => write!(f, "restarting"),
        }
    }
}

/// Where and how to reach the current server instance.
///
/// Components outside the supervisor only ever see this read-only value;
/// the port is fixed for the application run and the token for the run,
/// so an endpoint stays usable across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Instance that published this endpoint
    pub instance: ServerId,
    /// Listening port
    pub port: u16,
    /// Bearer token accepted by the instance
    pub token: String,
    /// Access mode the instance was launched with
    pub access: AccessControl,
}

impl ServerEndpoint {
    /// Endpoint for a server this process did not spawn itself.
    pub fn local(port: u16, token: impl Into<String>) -> Self {
        Self {
            instance: ServerId::new(),
            port,
            token: token.into(),
            access: AccessControl::LocalOnly,
        }
    }

    /// Root URL of the instance, with a trailing slash
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Absolute URL for a server path such as `/-/versions.json`
    pub fn url(&self, path: &str) -> String {
        format!(
            "http://127.0.0.1:{}/{}",
            self.port,
            path.trim_start_matches('/')
        )
    }
}

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Something degraded but the app continues
    Warning,
    /// Something failed
    Error,
}

/// A non-fatal problem the UI should show in a dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Dialog title
    pub title: String,
    /// Dialog body
    pub message: String,
}

impl Notice {
    /// Convenience constructor
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }
}
