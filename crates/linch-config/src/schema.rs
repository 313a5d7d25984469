use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration: maps to `linch.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinchConfig {
    pub extensions: ExtensionsConfig,
    pub sandbox: SandboxConfig,
    pub permissions: PermissionsConfig,
    pub monitor: MonitorConfig,
    pub hot_reload: HotReloadConfig,
    pub logging: LoggingConfig,
}

// ── Extensions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Directory scanned for extension packages (one sub-directory each).
    pub dir: PathBuf,
    /// Start every loaded extension right after registration.
    pub auto_start: bool,
    /// Upper bound for a single lifecycle hook (init/setup/start/ready/stop/destroy).
    pub hook_timeout_ms: u64,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("extensions"),
            auto_start: true,
            hook_timeout_ms: 30_000,
        }
    }
}

// ── Sandbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// When false, code runs directly in-process (trusted/test contexts only).
    pub enabled: bool,
    /// Hard timeout per sandboxed call.
    pub timeout_ms: u64,
    /// Memory ceiling for an isolate, in megabytes.
    pub memory_limit_mb: u64,
    /// Modules the isolate may compile or import. Empty = no restriction.
    pub allowed_modules: Vec<String>,
    /// Globals that must not be reachable from inside the sandbox.
    pub blocked_globals: Vec<String>,
    /// Expose `fetch` inside the sandbox.
    pub allow_network_access: bool,
    /// Expose `fs` inside the sandbox.
    pub allow_file_system_access: bool,
    /// Completed executions retained per executor.
    pub max_history: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5_000,
            memory_limit_mb: 128,
            allowed_modules: vec![],
            blocked_globals: default_blocked_globals(),
            allow_network_access: false,
            allow_file_system_access: false,
            max_history: 100,
        }
    }
}

/// Globals hidden from extension code unless explicitly un-blocked.
pub fn default_blocked_globals() -> Vec<String> {
    ["process", "require", "eval", "Function", "globalThis"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ── Permissions ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// How long a positive permission check stays cached.
    pub cache_ttl_secs: u64,
    /// Grant permissions that require user confirmation without asking.
    pub auto_grant: bool,
    /// How long to wait for the user to confirm a permission before denying it.
    pub confirmation_timeout_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            auto_grant: false,
            confirmation_timeout_secs: 120,
        }
    }
}

// ── Monitor ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enable_health_checks: bool,
    pub health_check_interval_secs: u64,
    pub enable_metrics: bool,
    pub metrics_interval_secs: u64,
    /// Memory ceiling used by the memory health check.
    pub memory_ceiling_mb: u64,
    pub response_warn_ms: u64,
    pub response_fail_ms: u64,
    /// Error rate (0.0–1.0) above which the error-rate check warns.
    pub error_rate_warn: f64,
    /// Error rate (0.0–1.0) above which the error-rate check fails.
    pub error_rate_fail: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_health_checks: true,
            health_check_interval_secs: 30,
            enable_metrics: true,
            metrics_interval_secs: 10,
            memory_ceiling_mb: 256,
            response_warn_ms: 500,
            response_fail_ms: 1_000,
            error_rate_warn: 0.05,
            error_rate_fail: 0.10,
        }
    }
}

// ── Hot reload ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// Quiet period after the last change before a reload fires.
    pub debounce_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 300,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{}: {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl LinchConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Sandbox ───
        if self.sandbox.timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.timeout_ms".into(),
                message: "timeout is 0: every sandboxed call would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5000".into()),
            });
        }
        if self.sandbox.memory_limit_mb == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.memory_limit_mb".into(),
                message: "memory limit is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 128".into()),
            });
        }
        if !self.sandbox.enabled {
            warnings.push(ConfigWarning {
                field: "sandbox.enabled".into(),
                message: "sandbox disabled: extension code runs unrestricted in-process".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Only disable the sandbox for trusted or test extensions".into()),
            });
        }
        if self.sandbox.allow_file_system_access && self.sandbox.allow_network_access {
            warnings.push(ConfigWarning {
                field: "sandbox".into(),
                message: "both filesystem and network access are exposed to extensions".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }
        if self.sandbox.max_history == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.max_history".into(),
                message: "execution history disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Extensions ───
        if self.extensions.hook_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "extensions.hook_timeout_ms".into(),
                message: "hook timeout is 0: lifecycle hooks could never complete".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30000".into()),
            });
        }

        // ── Permissions ───
        if self.permissions.auto_grant {
            warnings.push(ConfigWarning {
                field: "permissions.auto_grant".into(),
                message: "permissions requiring confirmation are granted without asking".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Leave disabled unless every installed extension is trusted".into()),
            });
        }

        // ── Monitor ───
        if self.monitor.enable_health_checks && self.monitor.health_check_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "monitor.health_check_interval_secs".into(),
                message: "interval is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set a positive interval or disable health checks".into()),
            });
        }
        if self.monitor.enable_metrics && self.monitor.metrics_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "monitor.metrics_interval_secs".into(),
                message: "interval is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set a positive interval or disable metrics collection".into()),
            });
        }
        if self.monitor.response_warn_ms > self.monitor.response_fail_ms {
            warnings.push(ConfigWarning {
                field: "monitor.response_warn_ms".into(),
                message: format!(
                    "warn threshold {}ms exceeds fail threshold {}ms",
                    self.monitor.response_warn_ms, self.monitor.response_fail_ms
                ),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        for (field, rate) in [
            ("monitor.error_rate_warn", self.monitor.error_rate_warn),
            ("monitor.error_rate_fail", self.monitor.error_rate_fail),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: format!("rate {} is out of range", rate),
                    severity: WarningSeverity::Error,
                    hint: Some("Rates are fractions between 0.0 and 1.0".into()),
                });
            }
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
