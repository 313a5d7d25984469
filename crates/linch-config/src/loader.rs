use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::LinchConfig;

/// Loads (and re-loads) the Linch configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<LinchConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > LINCH_CONFIG env > ~/.linch/linch.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LINCH_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".linch")
            .join("linch.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> linch_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            LinchConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory TOML document (no env overrides).
    pub fn from_toml_str(raw: &str) -> linch_core::Result<Self> {
        let config_path = PathBuf::from("<inline>");
        let config = Self::parse(raw, &config_path)?;
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> LinchConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<LinchConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept on any error.
    pub fn reload(&self) -> linch_core::Result<()> {
        if !self.config_path.exists() {
            return Err(linch_core::LinchError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = Self::apply_env_overrides(Self::parse(&raw, &self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn parse(raw: &str, path: &Path) -> linch_core::Result<LinchConfig> {
        toml::from_str::<LinchConfig>(raw).map_err(|e| {
            linch_core::LinchError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate config: log warnings, fail on errors.
    fn check(config: &LinchConfig) -> linch_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(linch_core::LinchError::Config(e)),
        }
    }

    /// Apply env var overrides (LINCH_LOG_LEVEL, LINCH_SANDBOX_TIMEOUT_MS, etc.)
    fn apply_env_overrides(mut config: LinchConfig) -> LinchConfig {
        if let Ok(v) = std::env::var("LINCH_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("LINCH_LOG_FORMAT") {
            config.logging.format = v;
        }
        if let Ok(v) = std::env::var("LINCH_SANDBOX_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.sandbox.timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("LINCH_EXTENSIONS_DIR") {
            config.extensions.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LINCH_HOT_RELOAD") {
            config.hot_reload.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        config
    }
}
