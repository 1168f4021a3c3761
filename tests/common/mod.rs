#![allow(dead_code)]

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    dev::ServerHandle,
    web::{self, Data, Json},
};
use async_trait::async_trait;
use datasette_app_runner::config::Config;
use datasette_app_runner::environment::{PackageRequirement, Provision, RuntimeRoot};
use datasette_app_runner::error::{Error, Result};
use datasette_app_runner::logs::LogAggregator;
use datasette_app_runner::server::Supervisor;
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Write an executable `/bin/sh` script
pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    file.write_all(format!("#!/bin/sh\n{}\n", body).as_bytes())
        .unwrap();
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Script body for a server that records its launch and becomes ready.
///
/// Writes its pid to `pids`, its arguments to `args` and the bearer token
/// it was given to `token`, all inside `state_dir`.
pub fn ready_server(state_dir: &Path) -> String {
    let dir = state_dir.display();
    format!(
        r#"echo "$$" >> '{dir}/pids'
echo "$@" >> '{dir}/args'
printf '%s' "$DATASETTE_API_TOKEN" > '{dir}/token'
echo "INFO:     Started server process [$$]" >&2
echo "INFO:     Waiting for application startup." >&2
echo "INFO:     Uvicorn running on http://127.0.0.1:$2 (Press CTRL+C to quit)" >&2
exec sleep 600"#
    )
}

/// Lines written to a state file by the fake server
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Whether a pid still names a live process
#[cfg(unix)]
pub fn pid_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Provisioner that hands out a prepared runtime directory
pub struct FakeRuntime {
    root: RuntimeRoot,
    fail_install: bool,
    pub installs: AtomicUsize,
}

impl FakeRuntime {
    /// Runtime rooted at `dir/venv`; the server script is written later
    pub fn new(dir: &Path) -> Self {
        Self {
            root: RuntimeRoot::new(dir.join("venv")),
            fail_install: false,
            installs: AtomicUsize::new(0),
        }
    }

    /// Same, but every package installation fails
    pub fn failing_install(dir: &Path) -> Self {
        Self {
            fail_install: true,
            ..Self::new(dir)
        }
    }

    pub fn root(&self) -> &RuntimeRoot {
        &self.root
    }

    /// Install `body` as the server executable
    pub fn with_server(self, body: &str) -> Self {
        write_script(&self.root.server_binary(), body);
        self
    }
}

#[async_trait]
impl Provision for FakeRuntime {
    async fn ensure_environment(&self) -> Result<RuntimeRoot> {
        Ok(self.root.clone())
    }

    async fn ensure_packages_installed(
        &self,
        _root: &RuntimeRoot,
        _requirements: &[PackageRequirement],
    ) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail_install {
            return Err(Error::PackageInstall(
                "ERROR: Could not find a version that satisfies the requirement datasette>=0.59a2"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Test configuration rooted in `app_dir`
pub fn test_config(app_dir: &Path) -> Config {
    Config {
        app_dir: Some(app_dir.to_path_buf()),
        ..Config::default()
    }
}

/// Supervisor with a fake runtime and fresh logs
pub fn supervisor(config: Config, port: u16, runtime: Arc<FakeRuntime>) -> Supervisor {
    Supervisor::new(config, port, runtime, Arc::new(LogAggregator::new(1000))).unwrap()
}

/// State behind the fake HTTP server
pub struct FakeState {
    /// File the fake server script writes the launch token into
    token_file: PathBuf,
    /// The "temporary database"
    pub rows: Mutex<Vec<String>>,
    pub dumps: AtomicUsize,
    pub restores: AtomicUsize,
}

/// An Actix server impersonating the supervised server's HTTP API
pub struct FakeDatasette {
    pub port: u16,
    pub state: Arc<FakeState>,
    handle: ServerHandle,
}

impl FakeDatasette {
    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

fn authorized(req: &HttpRequest, state: &FakeState) -> bool {
    let Ok(token) = std::fs::read_to_string(&state.token_file) else {
        return false;
    };
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", token))
}

fn denied() -> HttpResponse {
    HttpResponse::Forbidden().json(json!({"ok": false, "error": "Permission denied"}))
}

fn body_path(body: &Value) -> Option<PathBuf> {
    body.get("path").and_then(Value::as_str).map(PathBuf::from)
}

async fn dump(req: HttpRequest, state: Data<Arc<FakeState>>, body: Json<Value>) -> HttpResponse {
    if !authorized(&req, &state) {
        return denied();
    }
    let Some(path) = body_path(&body) else {
        return HttpResponse::BadRequest().json(json!({"ok": false, "error": "path required"}));
    };
    // The old process is about to die; its memory goes with it
    let rows: Vec<String> = std::mem::take(&mut *state.rows.lock().unwrap());
    std::fs::write(&path, serde_json::to_vec(&rows).unwrap()).unwrap();
    state.dumps.fetch_add(1, Ordering::SeqCst);
    HttpResponse::Ok().json(json!({"ok": true}))
}

async fn restore(req: HttpRequest, state: Data<Arc<FakeState>>, body: Json<Value>) -> HttpResponse {
    if !authorized(&req, &state) {
        return denied();
    }
    let Some(path) = body_path(&body) else {
        return HttpResponse::BadRequest().json(json!({"ok": false, "error": "path required"}));
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            *state.rows.lock().unwrap() = serde_json::from_slice(&bytes).unwrap();
            state.restores.fetch_add(1, Ordering::SeqCst);
            HttpResponse::Ok().json(json!({"ok": true}))
        }
        Err(e) => HttpResponse::Ok().json(json!({"ok": false, "error": e.to_string()})),
    }
}

async fn open_file(req: HttpRequest, state: Data<Arc<FakeState>>, body: Json<Value>) -> HttpResponse {
    if !authorized(&req, &state) {
        return denied();
    }
    match body_path(&body) {
        Some(path) if path.exists() => {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("data");
            let route = if matches!(req.path(), "/-/open-database-file" | "/-/new-empty-database-file") {
                format!("/{}", stem)
            } else {
                format!("/temporary/{}", stem)
            };
            HttpResponse::Ok().json(json!({"ok": true, "path": route}))
        }
        _ => HttpResponse::Ok().json(json!({"ok": false, "error": "File does not exist"})),
    }
}

async fn insert_row(req: HttpRequest, state: Data<Arc<FakeState>>, body: Json<Value>) -> HttpResponse {
    if !authorized(&req, &state) {
        return denied();
    }
    let row = body.get("row").and_then(Value::as_str).unwrap_or_default();
    state.rows.lock().unwrap().push(row.to_string());
    HttpResponse::Ok().json(json!({"ok": true}))
}

async fn rows(state: Data<Arc<FakeState>>) -> HttpResponse {
    HttpResponse::Ok().json(&*state.rows.lock().unwrap())
}

async fn auth_app_user(req: HttpRequest, state: Data<Arc<FakeState>>, body: Json<Value>) -> HttpResponse {
    if !authorized(&req, &state) {
        return denied();
    }
    let redirect = body
        .get("redirect")
        .and_then(Value::as_str)
        .unwrap_or("/")
        .to_string();
    HttpResponse::Found()
        .append_header(("Location", redirect))
        .append_header(("Set-Cookie", "ds_actor=app; Path=/"))
        .finish()
}

async fn versions() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "python": {"version": "3.9.6", "full": "3.9.6 (default, Jun 29 2021)"},
        "datasette": {"version": "0.59a2"},
        "sqlite": {"version": "3.36.0", "fts_versions": ["FTS5", "FTS4"]}
    }))
}

async fn page(req: HttpRequest) -> HttpResponse {
    let has_session = req
        .headers()
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("ds_actor=app"));
    if has_session {
        HttpResponse::Ok().body(format!("page {}", req.path()))
    } else {
        HttpResponse::Forbidden().body("login required")
    }
}

/// Start the fake HTTP server on a free localhost port.
///
/// Requests are authorized against the token found in `token_file`.
pub async fn start_fake_datasette(token_file: PathBuf) -> FakeDatasette {
    let state = Arc::new(FakeState {
        token_file,
        rows: Mutex::new(Vec::new()),
        dumps: AtomicUsize::new(0),
        restores: AtomicUsize::new(0),
    });
    let data = Data::new(Arc::clone(&state));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/-/dump-temporary-to-file", web::post().to(dump))
            .route("/-/restore-temporary-from-file", web::post().to(restore))
            .route("/-/open-csv-file", web::post().to(open_file))
            .route("/-/open-database-file", web::post().to(open_file))
            .route("/-/new-empty-database-file", web::post().to(open_file))
            .route("/-/import-csv-file", web::post().to(open_file))
            .route("/-/insert-row", web::post().to(insert_row))
            .route("/-/rows.json", web::get().to(rows))
            .route("/-/auth-app-user", web::post().to(auth_app_user))
            .route("/-/versions.json", web::get().to(versions))
            .default_service(web::get().to(page))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();

    let port = server.addrs()[0].port();
    let server = server.run();
    let handle = server.handle();
    tokio::spawn(server);

    FakeDatasette {
        port,
        state,
        handle,
    }
}
