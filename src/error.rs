/// Error handling module for the Datasette app runner.
///
/// This module defines the error types used throughout the library.
/// The variants follow the failure taxonomy of the supervisor: some are
/// fatal to the embedding application, the rest are surfaced to the user
/// as warnings and never disturb the supervisor's state machine.
///
/// # Example
///
/// ```
/// use datasette_app_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(e) if e.is_fatal() => eprintln!("Cannot continue: {}", e),
///         Err(Error::HelperCommand { stderr, .. }) => println!("Command failed:\n{}", stderr),
///         Err(e) => println!("Warning: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the datasette-app-runner library.
///
/// Every variant carries owned text rather than a source error so that the
/// enum is `Clone`: the outcome of a single start/restart cycle is handed to
/// every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains values that cannot be used.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Configuration is valid but fails a validation check.
    #[error("Config validation error: {0}")]
    ConfigValidation(String),

    /// No usable interpreter, or the isolated runtime could not be created.
    ///
    /// Fatal: the application cannot run without a runtime.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The package installer exited with a failure.
    ///
    /// Non-fatal: a launch is still attempted with whatever is installed.
    #[error("Package installation failed: {0}")]
    PackageInstall(String),

    /// The supervised server process could not be started.
    ///
    /// Fatal: without the server there is no usable UI.
    #[error("Failed to start server: {0}")]
    Spawn(String),

    /// Error while managing a running server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// A short-lived helper command exited non-zero.
    ///
    /// `stderr` holds the captured standard error lines, in order, joined
    /// with newlines.
    #[error("Command `{command}` failed: {stderr}")]
    HelperCommand {
        /// The command line that was run
        command: String,
        /// Aggregated standard error output
        stderr: String,
    },

    /// The running server could not export its temporary state.
    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    /// The replacement server could not import the exported state.
    #[error("Restore failed: {0}")]
    Restore(String),

    /// The server refused to open or create a file (`{ok: false, error}`).
    #[error("{0}")]
    FileOperation(String),

    /// An HTTP request to the server failed or returned garbage.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Missing or wrong bearer token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// An operation needs a running server but none is ready.
    #[error("Not running")]
    NotRunning,

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The window host refused a navigation or window operation.
    #[error("Window error: {0}")]
    Window(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether the embedding application should terminate on this error.
    ///
    /// A `Timeout` only arises from the optional startup timeout, and an
    /// expired startup is treated the same as a failed spawn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Provisioning(_) | Error::Spawn(_) | Error::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

/// Result type for datasette-app-runner operations.
pub type Result<T> = std::result::Result<T, Error>;
