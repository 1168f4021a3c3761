//! HTTP log viewer built on Actix Web.
//!
//! Exposes both log channels to out-of-process observers such as a log
//! window or `curl`:
//!
//! - `GET /logs/{server|process}` returns the retained entries as JSON
//! - `GET /logs/{server|process}/stream` replays them as Server-Sent Events
//!   and then streams new entries as they are recorded
//!
//! Every request needs `Authorization: Bearer <token>` when a token is
//! configured.

pub mod actix_error;
pub mod auth;
pub mod handlers;

use crate::config::LogViewerConfig;
use crate::error::{Error, Result};
use crate::log_viewer::auth::Authentication;
use crate::logs::LogAggregator;

use actix_web::{
    App, HttpServer,
    dev::ServerHandle,
    web::{self, Data},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Entry point for starting the viewer
pub struct LogViewer;

impl LogViewer {
    /// Bind and start serving in a background task.
    ///
    /// Port 0 picks a free port; the bound address is available from the
    /// returned handle.
    pub async fn start(logs: Arc<LogAggregator>, config: LogViewerConfig) -> Result<LogViewerHandle> {
        let token = Arc::new(config.token.clone());
        let logs_data = Data::new(logs);

        let server = HttpServer::new(move || {
            App::new()
                .app_data(logs_data.clone())
                .wrap(Authentication::new(token.clone()))
                .route("/logs/{channel}", web::get().to(handlers::history))
                .route("/logs/{channel}/stream", web::get().to(handlers::stream))
        })
        .workers(1)
        .disable_signals()
        .bind((config.address.as_str(), config.port))
        .map_err(|e| Error::Other(format!("Failed to bind log viewer: {}", e)))?;

        let addr = server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| Error::Other("Log viewer bound no address".to_string()))?;

        let server = server.run();
        let server_handle = server.handle();
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Log viewer server error");
            }
        });

        tracing::info!(%addr, auth = config.token.is_some(), "Log viewer started");
        Ok(LogViewerHandle {
            addr,
            server: server_handle,
            task,
        })
    }
}

/// Handle to a running log viewer
pub struct LogViewerHandle {
    addr: SocketAddr,
    server: ServerHandle,
    task: JoinHandle<()>,
}

impl LogViewerHandle {
    /// Address the viewer is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for a viewer path
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Stop serving. Open streams are closed.
    pub async fn stop(self) {
        self.server.stop(false).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Log viewer task did not finish cleanly");
        }
        tracing::info!(addr = %self.addr, "Log viewer stopped");
    }
}

impl std::fmt::Debug for LogViewerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogViewerHandle")
            .field("addr", &self.addr)
            .finish()
    }
}
