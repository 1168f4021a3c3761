use anyhow::Context;
use datasette_app_runner::DatasetteApp;
use datasette_app_runner::config::Config;
use datasette_app_runner::server::NoticeLevel;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config path is optional; defaults work for a standard install
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };

    // Console output plus a daily file inside the app directory
    let app_dir = config.resolved_app_dir()?;
    let file_appender = tracing_appender::rolling::daily(app_dir.join("logs"), "runner.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    tracing::info!("Starting headless datasette app");
    let mut app = DatasetteApp::new(config).await?;

    app.logs()
        .server()
        .subscribe(|entry| println!("[server {}] {}", entry.kind, entry.message));
    app.logs()
        .process()
        .subscribe(|entry| println!("[process {}] {}", entry.kind, entry.message));

    let mut notices = app.supervisor().subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice.level {
                NoticeLevel::Error => tracing::error!(title = %notice.title, "{}", notice.message),
                _ => tracing::warn!(title = %notice.title, "{}", notice.message),
            }
        }
    });

    let endpoint = match app.start().await {
        Ok(endpoint) => endpoint,
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Cannot run without the server");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    println!("Datasette is running at {}", endpoint.base_url());
    if let Some(line) = app.supervisor().command_line() {
        println!("Launch command: {}", line);
    }

    match app.about().await {
        Ok(about) => println!("{}", about),
        Err(e) => tracing::warn!(error = %e, "Could not read versions"),
    }

    let viewer = app.start_log_viewer().await?;
    println!("Logs: http://{}/logs/server/stream", viewer);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    app.shutdown().await?;
    Ok(())
}
