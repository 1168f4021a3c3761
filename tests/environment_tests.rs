#![cfg(unix)]

mod common;

use common::{read_lines, write_script};
use datasette_app_runner::environment::{
    EnvironmentProvisioner, PackageRequirement, Provision, RuntimeRoot,
};
use datasette_app_runner::error::{Error, Result};
use datasette_app_runner::logs::{LogAggregator, LogKind};
use datasette_app_runner::server::HelperRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A fake interpreter whose `-m venv DIR` copies working python3 and pip
/// scripts into `DIR/bin`, recording every creation.
struct FakePython {
    dir: TempDir,
}

impl FakePython {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let pip_log = dir.path().join("pip.log");

        write_script(&templates.join("python3"), r#"echo "Python 3.9.6""#);
        write_script(
            &templates.join("pip"),
            &format!(
                r#"echo "$@" >> '{log}'
case "$*" in
  *broken-package*)
    echo "ERROR: Could not find a version that satisfies the requirement broken-package>=1.0" >&2
    echo "ERROR: No matching distribution found for broken-package>=1.0" >&2
    exit 1;;
esac
echo "Requirement already satisfied: datasette>=0.59a2""#,
                log = pip_log.display()
            ),
        );
        write_script(
            &dir.path().join("python3.9"),
            &format!(
                r#"if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  cp '{tpl}/python3' "$3/bin/python3"
  cp '{tpl}/pip' "$3/bin/pip"
  echo "$3" >> '{created}'
  exit 0
fi
exit 64"#,
                tpl = templates.display(),
                created = dir.path().join("created").display()
            ),
        );

        Self { dir }
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("python3.9")
    }

    fn creations(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("created"))
    }

    fn pip_calls(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("pip.log"))
    }
}

fn provisioner(app_dir: &Path, candidates: Vec<PathBuf>) -> (EnvironmentProvisioner, Arc<LogAggregator>) {
    let logs = Arc::new(LogAggregator::new(1000));
    let provisioner = EnvironmentProvisioner::new(
        app_dir,
        candidates,
        HelperRunner::new(Arc::clone(&logs)),
    );
    (provisioner, logs)
}

#[tokio::test]
async fn test_creates_runtime_once() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    let app_dir = app.path().join(".datasette-app");
    let (provisioner, logs) = provisioner(
        &app_dir,
        vec![PathBuf::from("/nonexistent/python3.9"), python.path()],
    );

    let root = provisioner.ensure_environment().await?;
    assert_eq!(root, RuntimeRoot::new(app_dir.join("venv")));
    assert!(root.python().is_file());
    assert_eq!(python.creations().len(), 1);

    // A healthy runtime is reused
    let again = provisioner.ensure_environment().await?;
    assert_eq!(again, root);
    assert_eq!(python.creations().len(), 1);

    let history = logs.process().history();
    assert!(history
        .iter()
        .any(|e| e.kind == LogKind::Start && e.message.contains("-m venv")));
    assert!(history
        .iter()
        .any(|e| e.kind == LogKind::Stdout && e.message == "Python 3.9.6"));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_runtime_is_recreated() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    let venv = app.path().join("venv");
    write_script(&venv.join("bin").join("python3"), "exit 1");
    std::fs::write(venv.join("stale-marker"), "old").unwrap();

    let (provisioner, _logs) = provisioner(app.path(), vec![python.path()]);
    let root = provisioner.ensure_environment().await?;

    assert_eq!(python.creations().len(), 1);
    assert!(!venv.join("stale-marker").exists());
    assert!(root.pip().is_file());
    Ok(())
}

#[tokio::test]
async fn test_runtime_missing_interpreter_binary_is_recreated() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(app.path().join("venv").join("bin")).unwrap();

    let (provisioner, _logs) = provisioner(app.path(), vec![python.path()]);
    provisioner.ensure_environment().await?;

    assert_eq!(python.creations().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_interpreter_is_fatal() {
    let app = tempfile::tempdir().unwrap();
    let (provisioner, _logs) = provisioner(
        app.path(),
        vec![
            PathBuf::from("/nonexistent/a/python3.9"),
            PathBuf::from("/nonexistent/b/python3.9"),
        ],
    );

    let err = provisioner.ensure_environment().await.unwrap_err();
    assert!(err.is_fatal());
    match err {
        Error::Provisioning(message) => {
            assert!(message.contains("/nonexistent/a/python3.9"));
            assert!(message.contains("/nonexistent/b/python3.9"));
        }
        other => panic!("Expected Provisioning error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_package_install_is_idempotent() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    let (provisioner, _logs) = provisioner(app.path(), vec![python.path()]);
    let root = provisioner.ensure_environment().await?;

    let requirements = vec![
        PackageRequirement::new("datasette", "0.59a2"),
        PackageRequirement::new("datasette-app-support", "0.5"),
    ];
    provisioner
        .ensure_packages_installed(&root, &requirements)
        .await?;
    provisioner
        .ensure_packages_installed(&root, &requirements)
        .await?;

    let expected = "install --disable-pip-version-check --no-input datasette>=0.59a2 datasette-app-support>=0.5";
    assert_eq!(python.pip_calls(), vec![expected, expected]);
    Ok(())
}

#[tokio::test]
async fn test_empty_requirements_skip_installer() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    let (provisioner, _logs) = provisioner(app.path(), vec![python.path()]);
    let root = provisioner.ensure_environment().await?;

    provisioner.ensure_packages_installed(&root, &[]).await?;
    assert!(python.pip_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_package_failure_carries_installer_stderr() -> Result<()> {
    let python = FakePython::new();
    let app = tempfile::tempdir().unwrap();
    let (provisioner, logs) = provisioner(app.path(), vec![python.path()]);
    let root = provisioner.ensure_environment().await?;

    let err = provisioner
        .ensure_packages_installed(&root, &[PackageRequirement::new("broken-package", "1.0")])
        .await
        .unwrap_err();

    assert!(!err.is_fatal());
    assert_eq!(
        err,
        Error::PackageInstall(
            "ERROR: Could not find a version that satisfies the requirement broken-package>=1.0\n\
             ERROR: No matching distribution found for broken-package>=1.0"
                .to_string()
        )
    );
    let end = logs.process().history().pop().unwrap();
    assert_eq!(end.kind, LogKind::End);
    assert!(end.message.contains("exited with 1"));
    Ok(())
}
