//! State continuity across server restarts.
//!
//! The server keeps user data in a temporary in-memory database that would
//! be lost when the process is replaced. Before the old instance is stopped
//! the [`ContinuityManager`] has it dump that database to a uniquely named
//! file; once the replacement is ready the file is loaded back and deleted.

use crate::client::ApiClient;
use crate::error::{Error, Result};
use crate::logs::{LogAggregator, LogKind};
use crate::server::ServerEndpoint;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// A snapshot file waiting to be restored.
///
/// Deliberately neither `Clone` nor `Copy`: restoring consumes it, so one
/// artifact can only ever feed a single restart.
#[derive(Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    path: PathBuf,
}

impl BackupArtifact {
    /// Location of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Snapshots and restores the server's temporary database
#[derive(Debug, Clone)]
pub struct ContinuityManager {
    client: ApiClient,
    backup_dir: PathBuf,
    logs: Arc<LogAggregator>,
}

impl ContinuityManager {
    /// Create a manager writing artifacts into `backup_dir`
    pub fn new(client: ApiClient, backup_dir: impl Into<PathBuf>, logs: Arc<LogAggregator>) -> Self {
        Self {
            client,
            backup_dir: backup_dir.into(),
            logs,
        }
    }

    /// Directory artifacts are written to
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// A fresh, collision-free artifact path
    pub fn artifact_path(&self) -> PathBuf {
        self.backup_dir
            .join(format!("backup-{}.db", Uuid::new_v4().simple()))
    }

    /// Ask the running instance to write its temporary database to disk.
    ///
    /// Must complete before the instance is stopped. Any partially written
    /// file is removed on failure.
    #[tracing::instrument(skip(self, endpoint), fields(port = endpoint.port))]
    pub async fn snapshot(&self, endpoint: &ServerEndpoint) -> Result<BackupArtifact> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| Error::Snapshot(format!("Cannot create {}: {}", self.backup_dir.display(), e)))?;

        let path = self.artifact_path();
        match self.client.dump_temporary_to_file(endpoint, &path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Temporary database saved");
                self.logs
                    .server()
                    .log(LogKind::Stdout, &format!("Saved temporary database to {}", path.display()));
                Ok(BackupArtifact { path })
            }
            Err(e) => {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    tracing::debug!(path = %path.display(), "Removed partial snapshot");
                }
                Err(Error::Snapshot(e.to_string()))
            }
        }
    }

    /// Load an artifact into a ready instance, then delete the file.
    ///
    /// The file is deleted whether or not the load succeeded; a failed
    /// delete is only logged.
    #[tracing::instrument(skip(self, endpoint, artifact), fields(port = endpoint.port, path = %artifact.path.display()))]
    pub async fn restore(&self, endpoint: &ServerEndpoint, artifact: BackupArtifact) -> Result<()> {
        let result = self
            .client
            .restore_temporary_from_file(endpoint, &artifact.path)
            .await
            .map_err(|e| Error::Restore(e.to_string()));

        match &result {
            Ok(()) => {
                tracing::info!("Temporary database restored");
                self.logs.server().log(LogKind::Stdout, "Restored temporary database");
            }
            Err(e) => {
                tracing::error!(error = %e, "Restore failed");
                self.logs.server().log(LogKind::Error, &e.to_string());
            }
        }

        self.discard(artifact).await;
        result
    }

    /// Delete an artifact that will not be restored.
    pub async fn discard(&self, artifact: BackupArtifact) {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => tracing::debug!(path = %artifact.path.display(), "Backup artifact deleted"),
            Err(e) => tracing::warn!(path = %artifact.path.display(), error = %e, "Could not delete backup artifact"),
        }
    }
}
