//! Configuration module for the Datasette app runner.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for the supervised server. It supports loading configurations
//! from files or strings in JSON format. Every field is optional.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use datasette_app_runner::config::Config;
//!
//! let config = Config::from_file("datasette-app.json").unwrap();
//! println!("Server will allow: {}", config.access_control);
//! ```
//!
//! Creating a configuration programmatically:
//! ```
//! use datasette_app_runner::config::{AccessControl, Config};
//!
//! let config = Config {
//!     port: Some(8010),
//!     access_control: AccessControl::NetworkExposed,
//!     default_plugins: vec!["datasette-vega".to_string()],
//!     ..Config::default()
//! };
//! datasette_app_runner::config::validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{
    AccessControl, Config, DEFAULT_LOG_CAPACITY, DEFAULT_PORT, DEFAULT_READY_SIGNAL,
    LogViewerConfig, ServerSettings, default_interpreter_candidates,
};
pub use validator::validate_config;
