use crate::config::{Config, LogViewerConfig};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Validates the package requirement set
pub fn validate_requirements(requirements: &BTreeMap<String, String>) -> Result<()> {
    for (name, version) in requirements {
        if name.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "Package requirement has an empty name".to_string(),
            ));
        }
        if version.trim().is_empty() {
            return Err(Error::ConfigValidation(format!(
                "Package '{}' has an empty minimum version",
                name
            )));
        }
    }

    Ok(())
}

/// Validates the log viewer section
pub fn validate_log_viewer(config: &LogViewerConfig) -> Result<()> {
    if config.address.is_empty() {
        return Err(Error::ConfigValidation(
            "Log viewer address is empty".to_string(),
        ));
    }
    if let Some(token) = &config.token {
        if token.is_empty() {
            return Err(Error::ConfigValidation(
                "Log viewer token is empty; omit it to disable authentication".to_string(),
            ));
        }
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    if config.log_capacity == 0 {
        return Err(Error::ConfigValidation(
            "logCapacity must be at least 1".to_string(),
        ));
    }

    if config.ready_signal.trim().is_empty() {
        return Err(Error::ConfigValidation(
            "readySignal must not be empty".to_string(),
        ));
    }

    if config.startup_timeout_secs == Some(0) {
        return Err(Error::ConfigValidation(
            "startupTimeoutSecs must be positive; omit it to wait indefinitely".to_string(),
        ));
    }

    if config.interpreter_candidates.is_empty() {
        return Err(Error::ConfigValidation(
            "interpreterCandidates must list at least one interpreter".to_string(),
        ));
    }

    if config.port == Some(0) {
        return Err(Error::ConfigValidation("port must not be 0".to_string()));
    }

    validate_requirements(&config.requirements)?;

    if let Some(viewer) = &config.log_viewer {
        validate_log_viewer(viewer)?;
    }

    Ok(())
}
