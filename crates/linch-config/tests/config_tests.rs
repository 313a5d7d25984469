#[cfg(test)]
mod tests {
    use linch_config::ConfigLoader;
    use linch_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert!(config.enabled);
        assert_eq!(config.timeout_ms, 5_000);
        assert_eq!(config.memory_limit_mb, 128);
        assert!(!config.allow_network_access);
        assert!(!config.allow_file_system_access);
        assert!(config.blocked_globals.contains(&"process".to_string()));
    }

    #[test]
    fn test_permissions_config_defaults() {
        let config = PermissionsConfig::default();
        assert_eq!(config.cache_ttl_secs, 300);
        assert!(!config.auto_grant);
    }

    #[test]
    fn test_monitor_config_defaults() {
        let config = MonitorConfig::default();
        assert!(config.enable_health_checks);
        assert!(config.enable_metrics);
        assert_eq!(config.response_warn_ms, 500);
        assert_eq!(config.response_fail_ms, 1_000);
        assert_eq!(config.error_rate_warn, 0.05);
        assert_eq!(config.error_rate_fail, 0.10);
    }

    #[test]
    fn test_default_config_is_valid() {
        let warnings = LinchConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = LinchConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: LinchConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.sandbox.timeout_ms, config.sandbox.timeout_ms);
        assert_eq!(restored.extensions.dir, config.extensions.dir);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[sandbox]
timeout_ms = 50
allow_network_access = true

[hot_reload]
enabled = true
"#;
        let config: LinchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sandbox.timeout_ms, 50);
        assert!(config.sandbox.allow_network_access);
        assert!(config.hot_reload.enabled);
        // Defaults should fill in
        assert_eq!(config.sandbox.memory_limit_mb, 128);
        assert_eq!(config.hot_reload.debounce_ms, 300);
        assert_eq!(config.logging.level, "info");
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_zero_timeout_is_error() {
        let mut config = LinchConfig::default();
        config.sandbox.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("sandbox.timeout_ms"));
    }

    #[test]
    fn test_out_of_range_error_rate_is_error() {
        let mut config = LinchConfig::default();
        config.monitor.error_rate_fail = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_sandbox_warns() {
        let mut config = LinchConfig::default();
        config.sandbox.enabled = false;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "sandbox.enabled"
            && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let mut config = LinchConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        let w = warnings.iter().find(|w| w.field == "logging.format").unwrap();
        assert!(w.to_string().contains("xml"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("linch.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[extensions]
dir = "/opt/ext"
auto_start = false

[permissions]
cache_ttl_secs = 10
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert!(!config.extensions.auto_start);
        assert_eq!(config.permissions.cache_ttl_secs, 10);
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("linch.toml");
        std::fs::write(&config_path, "[sandbox]\nmemory_limit_mb = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_rejects_malformed_toml() {
        let err = ConfigLoader::from_toml_str("[sandbox\n").err().unwrap();
        assert_eq!(err.code(), linch_core::ErrorCode::ConfigError);
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("linch.toml");
        std::fs::write(&config_path, "[hot_reload]\ndebounce_ms = 100\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().hot_reload.debounce_ms, 100);

        std::fs::write(&config_path, "[hot_reload]\ndebounce_ms = 900\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().hot_reload.debounce_ms, 900);
    }

    #[test]
    fn test_failed_reload_keeps_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("linch.toml");
        std::fs::write(&config_path, "[monitor]\nmetrics_interval_secs = 7\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[monitor]\nmetrics_interval_secs = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().monitor.metrics_interval_secs, 7);
    }
}
