/// Client module for the supervised server's authenticated API.
///
/// This module provides the `ApiClient` which issues bearer-authenticated
/// requests against a [`ServerEndpoint`]. It allows applications to:
/// - Open CSV and SQLite files in the running server
/// - Create new empty database files and import CSV files into them
/// - Dump the temporary in-memory database to disk and load it back
/// - Query component versions
///
/// File operations answer with `{"ok": bool, "path": ..., "error": ...}`.
/// A refusal (`ok: false`) becomes [`Error::FileOperation`] carrying the
/// server's message, ready to be shown in a dialog.
use crate::error::{Error, Result};
use crate::server::ServerEndpoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// The header every SQLite database file starts with.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// How a user-selected file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A SQLite database, attached as-is
    Database,
    /// Anything else, imported as CSV
    Csv,
}

impl FileKind {
    /// Classify a file by its first 16 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileOperation`] if the file cannot be read.
    pub async fn sniff(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            Error::FileOperation(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut header = Vec::with_capacity(SQLITE_HEADER.len());
        file.take(SQLITE_HEADER.len() as u64)
            .read_to_end(&mut header)
            .await
            .map_err(|e| Error::FileOperation(format!("Cannot read {}: {}", path.display(), e)))?;

        Ok(Self::from_header(&header))
    }

    /// Classify already-read leading bytes.
    pub fn from_header(header: &[u8]) -> Self {
        if header == SQLITE_HEADER {
            FileKind::Database
        } else {
            FileKind::Csv
        }
    }
}

/// Version of one component reported by `/-/versions.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Version string as reported by the server
    pub version: String,
}

/// The subset of `/-/versions.json` the app displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// Interpreter version
    pub python: Component,
    /// Server package version
    pub datasette: Component,
    /// SQLite library version
    pub sqlite: Component,
}

impl Versions {
    /// Text for an "About" dialog.
    pub fn summary(&self) -> String {
        [
            "An open source multi-tool for exploring and publishing data".to_string(),
            String::new(),
            format!("Datasette: {}", self.datasette.version),
            format!("Python: {}", self.python.version),
            format!("SQLite: {}", self.sqlite.version),
        ]
        .join("\n")
    }
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    ok: bool,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A client for the supervised server's authenticated endpoints.
///
/// The client is cheap to clone and holds no per-instance state: every call
/// takes the [`ServerEndpoint`] to talk to, so one client keeps working
/// across restarts.
///
/// # Examples
///
/// ```no_run
/// use datasette_app_runner::client::ApiClient;
/// use datasette_app_runner::server::ServerEndpoint;
///
/// # async fn example() -> datasette_app_runner::Result<()> {
/// let client = ApiClient::new()?;
/// let endpoint = ServerEndpoint::local(8001, "token");
///
/// let opened = client.open_file(&endpoint, "/tmp/fixtures.db").await?;
/// println!("Opened at {}", opened);
///
/// println!("{}", client.about(&endpoint).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Sends an authenticated POST with a JSON body and decodes the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The server cannot be reached
    /// * The token is rejected ([`Error::Unauthorized`])
    /// * The reply is not the expected JSON
    pub async fn post<B, R>(&self, endpoint: &ServerEndpoint, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tracing::debug!(port = endpoint.port, path, "POST");
        let response = self
            .http
            .post(endpoint.url(path))
            .bearer_auth(&endpoint.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!("{} rejected the token", path)));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::warn!(path, %status, "Unexpected response body");
            Error::Http(format!("{} returned {} with an unreadable body: {}", path, status, e))
        })
    }

    async fn operation(&self, endpoint: &ServerEndpoint, path: &str, body: serde_json::Value) -> Result<Option<String>> {
        let reply: OperationResponse = self.post(endpoint, path, &body).await?;
        if reply.ok {
            Ok(reply.path)
        } else {
            let message = reply
                .error
                .unwrap_or_else(|| format!("{} failed", path));
            tracing::info!(path, error = %message, "Server refused file operation");
            Err(Error::FileOperation(message))
        }
    }

    async fn opened_path(&self, endpoint: &ServerEndpoint, path: &str, body: serde_json::Value) -> Result<String> {
        self.operation(endpoint, path, body)
            .await?
            .ok_or_else(|| Error::Http(format!("{} did not return a path", path)))
    }

    /// Opens a CSV file in the server and returns the path to navigate to.
    pub async fn open_csv_file(&self, endpoint: &ServerEndpoint, file: &Path) -> Result<String> {
        self.opened_path(endpoint, "/-/open-csv-file", json!({ "path": file.to_string_lossy() }))
            .await
    }

    /// Attaches a SQLite database file and returns the path to navigate to.
    pub async fn open_database_file(&self, endpoint: &ServerEndpoint, file: &Path) -> Result<String> {
        self.opened_path(endpoint, "/-/open-database-file", json!({ "path": file.to_string_lossy() }))
            .await
    }

    /// Opens a file with the endpoint matching its content.
    ///
    /// SQLite files go to [`open_database_file`](Self::open_database_file),
    /// everything else to [`open_csv_file`](Self::open_csv_file).
    pub async fn open_file(&self, endpoint: &ServerEndpoint, file: impl AsRef<Path>) -> Result<String> {
        let file = file.as_ref();
        match FileKind::sniff(file).await? {
            FileKind::Database => self.open_database_file(endpoint, file).await,
            FileKind::Csv => self.open_csv_file(endpoint, file).await,
        }
    }

    /// Creates an empty database at `file` and attaches it.
    pub async fn new_empty_database_file(&self, endpoint: &ServerEndpoint, file: &Path) -> Result<String> {
        self.opened_path(endpoint, "/-/new-empty-database-file", json!({ "path": file.to_string_lossy() }))
            .await
    }

    /// Imports a CSV file as a table in `database`.
    pub async fn import_csv_file(
        &self,
        endpoint: &ServerEndpoint,
        file: &Path,
        database: &str,
    ) -> Result<String> {
        self.opened_path(
            endpoint,
            "/-/import-csv-file",
            json!({ "path": file.to_string_lossy(), "database": database }),
        )
        .await
    }

    /// Asks the server to write its temporary database to `file`.
    pub async fn dump_temporary_to_file(&self, endpoint: &ServerEndpoint, file: &Path) -> Result<()> {
        self.operation(endpoint, "/-/dump-temporary-to-file", json!({ "path": file.to_string_lossy() }))
            .await
            .map(|_| ())
    }

    /// Asks the server to load its temporary database from `file`.
    pub async fn restore_temporary_from_file(&self, endpoint: &ServerEndpoint, file: &Path) -> Result<()> {
        self.operation(
            endpoint,
            "/-/restore-temporary-from-file",
            json!({ "path": file.to_string_lossy() }),
        )
        .await
        .map(|_| ())
    }

    /// Fetches `/-/versions.json`.
    pub async fn versions(&self, endpoint: &ServerEndpoint) -> Result<Versions> {
        let versions = self
            .http
            .get(endpoint.url("/-/versions.json"))
            .bearer_auth(&endpoint.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(versions)
    }

    /// Version summary for an "About" dialog.
    pub async fn about(&self, endpoint: &ServerEndpoint) -> Result<String> {
        Ok(self.versions(endpoint).await?.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_detection() {
        assert_eq!(FileKind::from_header(b"SQLite format 3\0"), FileKind::Database);
        assert_eq!(FileKind::from_header(b"id,name\n1,cleo\n2,"), FileKind::Csv);
        assert_eq!(FileKind::from_header(b"SQLite"), FileKind::Csv);
    }

    #[tokio::test]
    async fn test_sniff_reads_only_header() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("data.db");
        let mut bytes = SQLITE_HEADER.to_vec();
        bytes.extend_from_slice(&[0u8; 84]);
        std::fs::write(&db, bytes).unwrap();
        let csv = dir.path().join("data.csv");
        std::fs::write(&csv, "a,b\n1,2\n").unwrap();

        assert_eq!(FileKind::sniff(&db).await.unwrap(), FileKind::Database);
        assert_eq!(FileKind::sniff(&csv).await.unwrap(), FileKind::Csv);
        assert!(matches!(
            FileKind::sniff(dir.path().join("missing")).await,
            Err(Error::FileOperation(_))
        ));
    }

    #[test]
    fn test_about_summary() {
        let versions: Versions = serde_json::from_value(json!({
            "python": {"version": "3.9.6", "full": "3.9.6 (default)"},
            "datasette": {"version": "0.59a2"},
            "sqlite": {"version": "3.36.0", "fts_versions": ["FTS5"]}
        }))
        .unwrap();

        let summary = versions.summary();
        assert!(summary.starts_with("An open source multi-tool"));
        assert!(summary.ends_with("Datasette: 0.59a2\nPython: 3.9.6\nSQLite: 3.36.0"));
    }
}
