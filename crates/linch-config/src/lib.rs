//! # linch-config
//!
//! Configuration for the Linch runtime. Reads from `linch.toml` and applies
//! environment variable overrides on top, then validates the result.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, ExtensionsConfig, HotReloadConfig, LinchConfig, LoggingConfig, MonitorConfig,
    PermissionsConfig, SandboxConfig, WarningSeverity,
};
