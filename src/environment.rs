//! Isolated runtime provisioning.
//!
//! The server runs from a virtual environment inside the app directory.
//! [`EnvironmentProvisioner`] validates that environment, recreates it when
//! the interpreter inside is broken, and installs the package requirements
//! with the environment's installer.
//!
//! The supervisor talks to provisioning through the [`Provision`] trait so
//! that hosts can substitute their own strategy.

use crate::error::{Error, Result};
use crate::server::HelperRunner;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// A package that must be installed at or above a minimum version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRequirement {
    /// Distribution name
    pub name: String,
    /// Minimum acceptable version
    pub min_version: String,
}

impl PackageRequirement {
    /// Create a requirement
    pub fn new(name: impl Into<String>, min_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_version: min_version.into(),
        }
    }

    /// Installer constraint string, `name>=version`
    pub fn constraint(&self) -> String {
        format!("{}>={}", self.name, self.min_version)
    }

    /// Build the requirement list from a config map
    pub fn from_map(map: &BTreeMap<String, String>) -> Vec<Self> {
        map.iter()
            .map(|(name, version)| Self::new(name.clone(), version.clone()))
            .collect()
    }
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.constraint())
    }
}

/// Layout of a provisioned virtual environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRoot {
    dir: PathBuf,
}

impl RuntimeRoot {
    /// Wrap an environment directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Environment directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the environment's executables
    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.dir.join("Scripts")
        } else {
            self.dir.join("bin")
        }
    }

    /// The environment's interpreter
    pub fn python(&self) -> PathBuf {
        self.bin_dir().join(exe("python3"))
    }

    /// The environment's package installer
    pub fn pip(&self) -> PathBuf {
        self.bin_dir().join(exe("pip"))
    }

    /// The server executable installed by the `datasette` package
    pub fn server_binary(&self) -> PathBuf {
        self.bin_dir().join(exe("datasette"))
    }
}

fn exe(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Provisioning strategy used by the supervisor before each launch
#[async_trait]
pub trait Provision: Send + Sync {
    /// Make sure a working runtime exists and return its layout.
    ///
    /// Errors are [`Error::Provisioning`] and fatal.
    async fn ensure_environment(&self) -> Result<RuntimeRoot>;

    /// Install every requirement in one installer invocation.
    ///
    /// Must be safe to call repeatedly. Errors are
    /// [`Error::PackageInstall`] and non-fatal.
    async fn ensure_packages_installed(
        &self,
        root: &RuntimeRoot,
        requirements: &[PackageRequirement],
    ) -> Result<()>;
}

/// Virtual-environment provisioner backed by a located interpreter
#[derive(Debug, Clone)]
pub struct EnvironmentProvisioner {
    app_dir: PathBuf,
    interpreter_candidates: Vec<PathBuf>,
    helper: HelperRunner,
}

impl EnvironmentProvisioner {
    /// Create a provisioner rooted at `app_dir`.
    ///
    /// `interpreter_candidates` are tried in order when the environment
    /// has to be created.
    pub fn new(app_dir: impl Into<PathBuf>, interpreter_candidates: Vec<PathBuf>, helper: HelperRunner) -> Self {
        Self {
            app_dir: app_dir.into(),
            interpreter_candidates,
            helper,
        }
    }

    /// Where the environment lives
    pub fn runtime_root(&self) -> RuntimeRoot {
        RuntimeRoot::new(self.app_dir.join("venv"))
    }

    /// First candidate interpreter that exists on disk
    pub fn locate_interpreter(&self) -> Result<PathBuf> {
        self.interpreter_candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .cloned()
            .ok_or_else(|| {
                let checked = self
                    .interpreter_candidates
                    .iter()
                    .map(|c| c.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::error!(checked = %checked, "No interpreter found");
                Error::Provisioning(format!("Could not find python3, checked [{}]", checked))
            })
    }

    async fn is_usable(&self, root: &RuntimeRoot) -> bool {
        match self.helper.run(root.python(), ["--version"]).await {
            Ok(output) => {
                tracing::debug!(version = ?output.stdout.first(), "Existing runtime is usable");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, dir = %root.dir().display(), "Existing runtime is broken");
                false
            }
        }
    }
}

#[async_trait]
impl Provision for EnvironmentProvisioner {
    #[tracing::instrument(skip(self), fields(app_dir = %self.app_dir.display()))]
    async fn ensure_environment(&self) -> Result<RuntimeRoot> {
        let root = self.runtime_root();

        if root.dir().exists() {
            if self.is_usable(&root).await {
                return Ok(root);
            }
            tracing::info!("Removing broken runtime before recreating it");
            tokio::fs::remove_dir_all(root.dir()).await.map_err(|e| {
                Error::Provisioning(format!(
                    "Failed to remove broken runtime {}: {}",
                    root.dir().display(),
                    e
                ))
            })?;
        }

        tokio::fs::create_dir_all(&self.app_dir).await.map_err(|e| {
            Error::Provisioning(format!(
                "Failed to create {}: {}",
                self.app_dir.display(),
                e
            ))
        })?;

        let interpreter = self.locate_interpreter()?;
        tracing::info!(interpreter = %interpreter.display(), "Creating runtime");
        self.helper
            .run(&interpreter, [OsStr::new("-m"), OsStr::new("venv"), root.dir().as_os_str()])
            .await
            .map_err(|e| Error::Provisioning(format!("Failed to create runtime: {}", e)))?;

        Ok(root)
    }

    #[tracing::instrument(skip(self, root, requirements), fields(count = requirements.len()))]
    async fn ensure_packages_installed(
        &self,
        root: &RuntimeRoot,
        requirements: &[PackageRequirement],
    ) -> Result<()> {
        if requirements.is_empty() {
            return Ok(());
        }

        let mut args = vec![
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            "--no-input".to_string(),
        ];
        args.extend(requirements.iter().map(PackageRequirement::constraint));

        match self.helper.run(root.pip(), &args).await {
            Ok(_) => Ok(()),
            Err(Error::HelperCommand { stderr, .. }) => Err(Error::PackageInstall(stderr)),
            Err(e) => Err(Error::PackageInstall(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_format() {
        let req = PackageRequirement::new("datasette-app-support", "0.5");
        assert_eq!(req.constraint(), "datasette-app-support>=0.5");
        assert_eq!(req.to_string(), "datasette-app-support>=0.5");
    }

    #[test]
    fn test_requirements_from_map_are_sorted() {
        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), "1".to_string());
        map.insert("alpha".to_string(), "2".to_string());

        let names: Vec<_> = PackageRequirement::from_map(&map)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_runtime_layout() {
        let root = RuntimeRoot::new("/home/me/.datasette-app/venv");
        assert_eq!(root.python(), PathBuf::from("/home/me/.datasette-app/venv/bin/python3"));
        assert_eq!(root.pip(), PathBuf::from("/home/me/.datasette-app/venv/bin/pip"));
        assert_eq!(
            root.server_binary(),
            PathBuf::from("/home/me/.datasette-app/venv/bin/datasette")
        );
    }
}
