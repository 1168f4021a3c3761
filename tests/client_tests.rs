mod common;

use common::start_fake_datasette;
use datasette_app_runner::ApiClient;
use datasette_app_runner::client::SQLITE_HEADER;
use datasette_app_runner::error::{Error, Result};
use datasette_app_runner::server::ServerEndpoint;
use tempfile::TempDir;

const TOKEN: &str = "client-token";

async fn fixture() -> (TempDir, common::FakeDatasette, ServerEndpoint) {
    let dir = tempfile::tempdir().unwrap();
    let token_file = dir.path().join("token");
    std::fs::write(&token_file, TOKEN).unwrap();
    let fake = start_fake_datasette(token_file).await;
    let endpoint = ServerEndpoint::local(fake.port, TOKEN);
    (dir, fake, endpoint)
}

#[tokio::test]
async fn test_open_file_dispatches_on_content() -> Result<()> {
    let (dir, fake, endpoint) = fixture().await;
    let client = ApiClient::new()?;

    let db = dir.path().join("fixtures.db");
    let mut bytes = SQLITE_HEADER.to_vec();
    bytes.extend_from_slice(&[0u8; 100]);
    std::fs::write(&db, bytes).unwrap();
    // Extension does not matter, only the header does
    let csv = dir.path().join("counties.db");
    std::fs::write(&csv, "id,name\n1,Alameda\n").unwrap();

    assert_eq!(client.open_file(&endpoint, &db).await?, "/fixtures");
    assert_eq!(client.open_file(&endpoint, &csv).await?, "/temporary/counties");

    fake.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_refused_operation_carries_server_message() -> Result<()> {
    let (dir, fake, endpoint) = fixture().await;
    let client = ApiClient::new()?;

    let err = client
        .open_csv_file(&endpoint, &dir.path().join("missing.csv"))
        .await
        .unwrap_err();
    assert_eq!(err, Error::FileOperation("File does not exist".to_string()));
    assert_eq!(err.to_string(), "File does not exist");

    fake.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_create_and_import() -> Result<()> {
    let (dir, fake, endpoint) = fixture().await;
    let client = ApiClient::new()?;

    let db = dir.path().join("new.db");
    std::fs::write(&db, "").unwrap();
    assert_eq!(client.new_empty_database_file(&endpoint, &db).await?, "/new");

    let csv = dir.path().join("trees.csv");
    std::fs::write(&csv, "species\noak\n").unwrap();
    assert_eq!(
        client.import_csv_file(&endpoint, &csv, "new").await?,
        "/temporary/trees"
    );

    fake.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() -> Result<()> {
    let (dir, fake, endpoint) = fixture().await;
    let client = ApiClient::new()?;
    let stale = ServerEndpoint::local(endpoint.port, "stale");

    let csv = dir.path().join("a.csv");
    std::fs::write(&csv, "a\n1\n").unwrap();
    assert!(matches!(
        client.open_file(&stale, &csv).await,
        Err(Error::Unauthorized(_))
    ));

    fake.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_about_text() -> Result<()> {
    let (_dir, fake, endpoint) = fixture().await;
    let client = ApiClient::new()?;

    let versions = client.versions(&endpoint).await?;
    assert_eq!(versions.datasette.version, "0.59a2");

    let about = client.about(&endpoint).await?;
    assert!(about.contains("Datasette: 0.59a2"));
    assert!(about.contains("Python: 3.9.6"));
    assert!(about.contains("SQLite: 3.36.0"));

    fake.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_app_facade_routes_through_ready_server() -> Result<()> {
    use common::{FakeRuntime, ready_server, test_config};
    use datasette_app_runner::DatasetteApp;
    use datasette_app_runner::logs::LogAggregator;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    std::fs::create_dir_all(&state).unwrap();
    let fake = start_fake_datasette(state.join("token")).await;
    let runtime = Arc::new(FakeRuntime::new(dir.path()).with_server(&ready_server(&state)));

    let config = test_config(&dir.path().join("app"));
    let logs = Arc::new(LogAggregator::new(config.log_capacity));
    let mut app = DatasetteApp::with_provisioner(config, fake.port, logs, runtime)?;

    let csv = dir.path().join("birds.csv");
    std::fs::write(&csv, "name\npuffin\n").unwrap();
    assert_eq!(app.open_file(&csv).await, Err(Error::NotRunning));

    app.start().await?;
    assert_eq!(app.open_file(&csv).await?, "/temporary/birds");
    assert!(app.about().await?.contains("Datasette: 0.59a2"));

    let viewer = app.start_log_viewer().await?;
    assert_eq!(app.start_log_viewer().await?, viewer);

    app.shutdown().await?;
    // A second shutdown has nothing left to stop
    app.shutdown().await?;
    assert!(app.supervisor().endpoint().is_none());

    fake.stop().await;
    Ok(())
}
