//! Authenticated navigation from UI windows to the server.
//!
//! Windows never see the bearer token in a URL. Instead each navigation is
//! a POST to `/-/auth-app-user` carrying the token in an `authorization`
//! header and the target path in the body; the server answers with a
//! redirect to that path and sets a session cookie on the way.
//!
//! The native window layer is abstracted as [`WindowHost`].

use crate::error::{Error, Result};
use crate::server::ServerEndpoint;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Path of the server's session handshake endpoint
pub const AUTH_PATH: &str = "/-/auth-app-user";

/// Identifies a native window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// What the gateway needs to know about an open window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    /// Window identifier
    pub id: WindowId,
    /// URL currently loaded, if any
    pub url: Option<String>,
}

/// A navigation the window host must perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationRequest {
    /// Absolute URL to load
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Raw request body
    pub body: Vec<u8>,
}

impl NavigationRequest {
    /// The handshake navigation for `path` against `endpoint`
    pub fn handshake(endpoint: &ServerEndpoint, path: &str) -> Self {
        Self {
            url: endpoint.url(AUTH_PATH),
            method: "POST".to_string(),
            headers: vec![(
                "authorization".to_string(),
                format!("Bearer {}", endpoint.token),
            )],
            body: json!({ "redirect": path }).to_string().into_bytes(),
        }
    }
}

/// Options for [`SessionGateway::open_path`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Reuse the only window even if it is not showing the root page
    pub force_main_window: bool,
}

/// Native window operations the gateway relies on
#[async_trait]
pub trait WindowHost: Send + Sync {
    /// All open windows
    fn windows(&self) -> Vec<WindowInfo>;

    /// Load `request` in an existing window
    fn navigate(&self, window: WindowId, request: &NavigationRequest) -> Result<()>;

    /// Create a window that stays hidden until shown
    fn create_hidden_window(&self) -> Result<WindowId>;

    /// Resolve once the window's content has finished loading
    async fn wait_until_ready(&self, window: WindowId) -> Result<()>;

    /// Make a hidden window visible
    fn show(&self, window: WindowId) -> Result<()>;
}

/// Result of establishing a session over HTTP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// URL reached after following the redirect
    pub final_url: String,
    /// Status of the final response
    pub status: u16,
}

/// Opens server paths in windows with an authenticated session.
///
/// The gateway reads the current endpoint from the supervisor's watch
/// channel on every call, so a restart between calls is transparent: the
/// port stays the same and the handshake simply creates a new session.
pub struct SessionGateway {
    host: Arc<dyn WindowHost>,
    endpoint: watch::Receiver<Option<ServerEndpoint>>,
    http: reqwest::Client,
}

impl SessionGateway {
    /// Create a gateway driving `host`
    pub fn new(host: Arc<dyn WindowHost>, endpoint: watch::Receiver<Option<ServerEndpoint>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            host,
            endpoint,
            http,
        })
    }

    /// The endpoint navigations currently target
    pub fn current_endpoint(&self) -> Result<ServerEndpoint> {
        self.endpoint.borrow().clone().ok_or(Error::NotRunning)
    }

    /// Open `path` (default `/`) against the current instance.
    pub async fn open_path(&self, path: Option<&str>, options: OpenOptions) -> Result<WindowId> {
        let endpoint = self.current_endpoint()?;
        self.open_path_on(&endpoint, path, options).await
    }

    /// Open `path` against a specific endpoint.
    ///
    /// If exactly one window exists and either `force_main_window` is set
    /// or it shows the root page, that window navigates in place.
    /// Otherwise a hidden window is created, navigated, and shown once its
    /// content has loaded.
    #[tracing::instrument(skip(self, endpoint, options), fields(port = endpoint.port))]
    pub async fn open_path_on(
        &self,
        endpoint: &ServerEndpoint,
        path: Option<&str>,
        options: OpenOptions,
    ) -> Result<WindowId> {
        let path = normalize_path(path);
        let request = NavigationRequest::handshake(endpoint, &path);

        let windows = self.host.windows();
        if let [only] = windows.as_slice() {
            let at_root = only.url.as_deref().is_some_and(is_root_url);
            if options.force_main_window || at_root {
                tracing::debug!(window = %only.id, path = %path, "Navigating existing window");
                self.host.navigate(only.id, &request)?;
                return Ok(only.id);
            }
        }

        let window = self.host.create_hidden_window()?;
        tracing::debug!(%window, path = %path, "Opening new window");
        self.host.navigate(window, &request)?;
        self.host.wait_until_ready(window).await?;
        self.host.show(window)?;
        Ok(window)
    }

    /// Run the handshake over HTTP and keep the resulting session cookie.
    ///
    /// Used by headless hosts and to check that a freshly started instance
    /// accepts the token.
    pub async fn establish_session(&self, endpoint: &ServerEndpoint, path: &str) -> Result<SessionInfo> {
        let path = normalize_path(Some(path));
        let response = self
            .http
            .post(endpoint.url(AUTH_PATH))
            .bearer_auth(&endpoint.token)
            .json(&json!({ "redirect": path }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::warn!(port = endpoint.port, "Session handshake rejected");
            return Err(Error::Unauthorized(
                "Server rejected the session handshake".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(Error::Http(format!("Session handshake returned {}", status)));
        }

        Ok(SessionInfo {
            final_url: response.url().to_string(),
            status: status.as_u16(),
        })
    }

    /// The cookie-carrying client used by [`establish_session`](Self::establish_session)
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

impl fmt::Debug for SessionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGateway")
            .field("endpoint", &*self.endpoint.borrow())
            .finish()
    }
}

fn normalize_path(path: Option<&str>) -> String {
    match path {
        None | Some("") => "/".to_string(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
    }
}

fn is_root_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| u.path() == "/")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(None), "/");
        assert_eq!(normalize_path(Some("")), "/");
        assert_eq!(normalize_path(Some("fixtures")), "/fixtures");
        assert_eq!(normalize_path(Some("/-/plugins")), "/-/plugins");
    }

    #[test]
    fn test_root_detection() {
        assert!(is_root_url("http://127.0.0.1:8001/"));
        assert!(is_root_url("http://127.0.0.1:8001/?_search=x"));
        assert!(!is_root_url("http://127.0.0.1:8001/fixtures"));
        assert!(!is_root_url("file:///app/loading.html"));
        assert!(!is_root_url("not a url"));
    }

    #[test]
    fn test_handshake_request_keeps_token_out_of_url() {
        let endpoint = ServerEndpoint::local(8001, "s3cret");
        let request = NavigationRequest::handshake(&endpoint, "/fixtures");

        assert_eq!(request.url, "http://127.0.0.1:8001/-/auth-app-user");
        assert!(!request.url.contains("s3cret"));
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.headers,
            vec![("authorization".to_string(), "Bearer s3cret".to_string())]
        );
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body, json!({"redirect": "/fixtures"}));
    }
}
