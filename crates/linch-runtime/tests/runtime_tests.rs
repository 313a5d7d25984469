#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use linch_config::{LinchConfig, MonitorConfig, SandboxConfig};
    use linch_core::*;
    use linch_permission::{ConfirmationGate, ConfirmationResponse, PermissionEngine};
    use linch_runtime::*;
    use linch_sandbox::{EventHub, NativeModule, NativeModules, SandboxEnvironment, SharedStore};
    use parking_lot::Mutex;
    use serde_json::{Map, Value, json};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ── Fixtures ───────────────────────────────────────────────

    type Log = Arc<Mutex<Vec<String>>>;

    /// Hooks that append `<id>:<hook>` to a shared log.
    struct Recorder {
        id: &'static str,
        log: Log,
        fail_on: Option<LifecycleHook>,
        failing: Arc<AtomicBool>,
        slow: Option<Duration>,
        unhealthy: bool,
    }

    impl Recorder {
        fn new(id: &'static str, log: &Log) -> Self {
            Self {
                id,
                log: Arc::clone(log),
                fail_on: None,
                failing: Arc::new(AtomicBool::new(true)),
                slow: None,
                unhealthy: false,
            }
        }

        fn reporting_unhealthy(mut self) -> Self {
            self.unhealthy = true;
            self
        }

        fn failing_on(mut self, hook: LifecycleHook) -> Self {
            self.fail_on = Some(hook);
            self
        }

        async fn record(&self, hook: LifecycleHook) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:{}", self.id, hook));
            if let Some(delay) = self.slow {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on == Some(hook) && self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("{} refused to {}", self.id, hook);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExtensionHooks for Recorder {
        async fn init(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Init).await
        }
        async fn setup(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Setup).await
        }
        async fn start(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Start).await
        }
        async fn ready(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Ready).await
        }
        async fn stop(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Stop).await
        }
        async fn destroy(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.record(LifecycleHook::Destroy).await
        }
        async fn health_check(&self, _ctx: &ExtensionContext) -> anyhow::Result<bool> {
            Ok(!self.unhealthy)
        }
    }

    struct Harness {
        registry: Arc<LifecycleRegistry>,
        permissions: Arc<PermissionEngine>,
        log: Log,
    }

    fn harness_with(modules: NativeModules, hook_timeout: Duration) -> Harness {
        let permissions = Arc::new(PermissionEngine::with_builtin_policies(Duration::from_secs(
            60,
        )));
        let sandbox = SandboxEnvironment {
            config: SandboxConfig::default(),
            permissions: Arc::clone(&permissions),
            store: SharedStore::new(),
            hub: EventHub::new(),
            isolates: Arc::new(modules),
        };
        let monitor = Arc::new(StateMonitor::new(MonitorConfig::default()));
        Harness {
            registry: LifecycleRegistry::new(sandbox, monitor, hook_timeout),
            permissions,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn harness() -> Harness {
        harness_with(NativeModules::new(), Duration::from_secs(2))
    }

    fn meta(id: &str, deps: &[&str]) -> ExtensionMetadata {
        deps.iter()
            .fold(ExtensionMetadata::new(id, "1.0.0"), |m, d| m.depends_on(*d))
    }

    impl Harness {
        async fn add(&self, id: &'static str, deps: &[&str]) {
            self.add_hooks(id, deps, Recorder::new(id, &self.log)).await;
        }

        async fn add_hooks(&self, id: &str, deps: &[&str], hooks: Recorder) {
            self.registry
                .register(Extension::new(meta(id, deps), Arc::new(hooks)), Map::new())
                .await
                .unwrap();
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn status(&self, id: &str) -> Option<ExtensionStatus> {
            self.registry.status(&id.into())
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} not in {log:?}"))
    }

    // ── Dependency ordering ────────────────────────────────────

    #[tokio::test]
    async fn test_dependencies_are_running_before_dependent_start_hook() {
        let h = harness();
        h.add("app", &["api", "db"]).await;
        h.add("api", &["db"]).await;
        h.add("db", &[]).await;

        h.registry.start(&"app".into()).await.unwrap();

        let log = h.log();
        assert!(position(&log, "db:ready") < position(&log, "api:init"));
        assert!(position(&log, "api:ready") < position(&log, "app:init"));
        for id in ["app", "api", "db"] {
            assert_eq!(h.status(id), Some(ExtensionStatus::Running));
        }
        // db started once even though two extensions depend on it
        assert_eq!(log.iter().filter(|e| *e == "db:init").count(), 1);
        assert_eq!(log.len(), 12);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_when_running() {
        let h = harness();
        h.add("db", &[]).await;
        h.registry.start(&"db".into()).await.unwrap();
        h.registry.start(&"db".into()).await.unwrap();
        assert_eq!(h.log().len(), 4);
    }

    #[tokio::test]
    async fn test_mutual_dependency_fails_before_any_hook() {
        let h = harness();
        h.add("a", &["b"]).await;
        h.add("b", &["a"]).await;

        let err = h.registry.start(&"a".into()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircularDependency);
        assert!(h.log().is_empty());
        assert_eq!(h.status("a"), Some(ExtensionStatus::Registered));
        assert_eq!(h.status("b"), Some(ExtensionStatus::Registered));
    }

    #[tokio::test]
    async fn test_stop_stops_running_dependents_first() {
        let h = harness();
        h.add("db", &[]).await;
        h.add("api", &["db"]).await;
        h.add("admin", &["api"]).await;
        h.registry.start(&"admin".into()).await.unwrap();
        h.log.lock().clear();

        h.registry.stop(&"db".into()).await.unwrap();

        assert_eq!(h.log(), vec!["admin:stop", "api:stop", "db:stop"]);
        for id in ["admin", "api", "db"] {
            assert_eq!(h.status(id), Some(ExtensionStatus::Stopped));
        }
        // stopping again is a no-op
        h.registry.stop(&"db".into()).await.unwrap();
        assert_eq!(h.log().len(), 3);
    }

    // ── Failures ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_hook_failure_sets_error_and_keeps_original_message() {
        let h = harness();
        h.add_hooks(
            "db",
            &[],
            Recorder::new("db", &h.log).failing_on(LifecycleHook::Setup),
        )
        .await;

        let err = h.registry.start(&"db".into()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StartError);
        assert!(err.to_string().contains("db refused to setup"));

        // the sequence stopped at the failing hook
        assert_eq!(h.log(), vec!["db:init", "db:setup"]);
        let info = h.registry.get(&"db".into()).unwrap();
        assert_eq!(info.status, ExtensionStatus::Error);
        assert!(info.error.unwrap().message.contains("db refused to setup"));
    }

    #[tokio::test]
    async fn test_explicit_start_retries_an_errored_extension() {
        let h = harness();
        let hooks = Recorder::new("db", &h.log).failing_on(LifecycleHook::Init);
        let failing = Arc::clone(&hooks.failing);
        h.add_hooks("db", &[], hooks).await;

        assert!(h.registry.start(&"db".into()).await.is_err());
        assert_eq!(h.status("db"), Some(ExtensionStatus::Error));

        failing.store(false, Ordering::SeqCst);
        h.registry.start(&"db".into()).await.unwrap();
        let info = h.registry.get(&"db".into()).unwrap();
        assert_eq!(info.status, ExtensionStatus::Running);
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_dependency_failure_is_reported_by_the_requested_extension() {
        let h = harness();
        h.add_hooks(
            "db",
            &[],
            Recorder::new("db", &h.log).failing_on(LifecycleHook::Start),
        )
        .await;
        h.add("api", &["db"]).await;

        let err = h.registry.start(&"api".into()).await.unwrap_err();
        match &err {
            LinchError::Start { extension, reason } => {
                assert_eq!(extension.as_str(), "api");
                assert!(reason.contains("dependency db failed"));
                assert!(reason.contains("db refused to start"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.status("db"), Some(ExtensionStatus::Error));
        assert_eq!(h.status("api"), Some(ExtensionStatus::Registered));
        assert!(!h.log().iter().any(|e| e.starts_with("api:")));
    }

    #[tokio::test]
    async fn test_slow_hook_times_out_into_error() {
        let h = harness_with(NativeModules::new(), Duration::from_millis(50));
        let mut hooks = Recorder::new("slow", &h.log);
        hooks.slow = Some(Duration::from_secs(5));
        h.add_hooks("slow", &[], hooks).await;

        let err = h.registry.start(&"slow".into()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StartError);
        assert!(err.to_string().contains("timed out"));
        assert_eq!(h.status("slow"), Some(ExtensionStatus::Error));
    }

    #[tokio::test]
    async fn test_start_all_isolates_failures() {
        let h = harness();
        h.add_hooks(
            "a",
            &[],
            Recorder::new("a", &h.log).failing_on(LifecycleHook::Init),
        )
        .await;
        h.add("b", &[]).await;

        let results = h.registry.start_all().await;
        assert_eq!(results.len(), 2);
        let a = results.iter().find(|r| r.extension_id.as_str() == "a").unwrap();
        let b = results.iter().find(|r| r.extension_id.as_str() == "b").unwrap();
        assert!(!a.success());
        assert!(b.success());
        assert_eq!(h.status("a"), Some(ExtensionStatus::Error));
        assert_eq!(h.status("b"), Some(ExtensionStatus::Running));
    }

    #[tokio::test]
    async fn test_start_all_skips_disabled_and_stop_all_reverses() {
        let h = harness();
        h.add("db", &[]).await;
        h.add("api", &["db"]).await;
        let mut config = Map::new();
        config.insert("enabled".into(), Value::Bool(false));
        h.registry
            .register(Extension::without_hooks(meta("off", &[])), config)
            .await
            .unwrap();

        let results = h.registry.start_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(BulkResult::success));
        assert_eq!(h.status("off"), Some(ExtensionStatus::Registered));

        h.log.lock().clear();
        let results = h.registry.stop_all().await;
        assert!(results.iter().all(BulkResult::success));
        assert_eq!(h.log(), vec!["api:stop", "db:stop"]);
    }

    // ── Unregister ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_unregister_lists_exactly_the_dependents() {
        let h = harness();
        h.add("auth", &[]).await;
        h.add("blog", &["auth"]).await;
        h.add("shop", &["auth"]).await;
        h.add("theme", &[]).await;

        let err = h.registry.unregister(&"auth".into()).await.unwrap_err();
        match err {
            LinchError::HasDependents { dependents, .. } => {
                assert_eq!(dependents, vec!["blog".into(), ExtensionId::from("shop")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.registry.is_registered(&"auth".into()));
        assert!(h.registry.monitor().get_state(&"auth".into()).is_some());
    }

    #[tokio::test]
    async fn test_unregister_stops_destroys_and_revokes() {
        let h = harness();
        h.add("blog", &[]).await;
        h.registry.start(&"blog".into()).await.unwrap();
        h.permissions
            .grant_permission(&"blog".into(), "database:read", Default::default())
            .unwrap();
        let mut events = h.registry.subscribe();

        h.registry.unregister(&"blog".into()).await.unwrap();

        let log = h.log();
        assert_eq!(&log[log.len() - 2..], ["blog:stop", "blog:destroy"]);
        assert!(h.permissions.get_extension_grants(&"blog".into()).is_empty());
        assert!(!h.registry.is_registered(&"blog".into()));
        assert!(h.registry.monitor().get_state(&"blog".into()).is_none());

        let mut saw_unregistered = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LifecycleEvent::Unregistered { ref extension_id } if extension_id.as_str() == "blog")
            {
                saw_unregistered = true;
            }
        }
        assert!(saw_unregistered);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_not_found() {
        let h = harness();
        let id = ExtensionId::from("ghost");
        assert_eq!(
            h.registry.unregister(&id).await.unwrap_err().code(),
            ErrorCode::ExtensionNotFound
        );
        assert_eq!(
            h.registry.start(&id).await.unwrap_err().code(),
            ErrorCode::ExtensionNotFound
        );
    }

    #[tokio::test]
    async fn test_register_unregister_register_gives_fresh_state() {
        let h = harness();
        h.add("blog", &[]).await;
        let id = ExtensionId::from("blog");
        h.registry
            .monitor()
            .record_request(&id, Duration::from_millis(20), true);
        assert_eq!(
            h.registry.monitor().get_state(&id).unwrap().metrics.request_count,
            1
        );

        h.registry.unregister(&id).await.unwrap();
        h.add("blog", &[]).await;

        let state = h.registry.monitor().get_state(&id).unwrap();
        assert_eq!(state.metrics.request_count, 0);
        assert_eq!(state.metrics.error_count, 0);
        assert_eq!(state.status, ExtensionStatus::Registered);
        assert_eq!(state.health.score, 100);
        assert_eq!(state.health.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_registration_and_state_exist_together() {
        let h = harness();
        h.add("a", &[]).await;
        h.add("b", &["a"]).await;
        let registered: Vec<ExtensionId> =
            h.registry.list().into_iter().map(|i| i.metadata.id).collect();
        let tracked: Vec<ExtensionId> = h
            .registry
            .monitor()
            .all_states()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(registered, tracked);
    }

    // ── Monitor integration ────────────────────────────────────

    #[tokio::test]
    async fn test_health_check_of_running_extension() {
        let h = harness();
        h.add("blog", &[]).await;
        h.registry.start(&"blog".into()).await.unwrap();

        let health = h
            .registry
            .monitor()
            .perform_health_check(&"blog".into())
            .await
            .unwrap();
        assert_eq!(health.score, 100);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_answer_fails_response_time_check() {
        let h = harness();
        h.add_hooks("blog", &[], Recorder::new("blog", &h.log).reporting_unhealthy())
            .await;
        h.registry.start(&"blog".into()).await.unwrap();

        let health = h
            .registry
            .monitor()
            .perform_health_check(&"blog".into())
            .await
            .unwrap();
        let check = health
            .checks
            .iter()
            .find(|c| c.name == "response_time")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.message.contains("unhealthy"));
        assert_eq!(health.score, 75);
        assert_eq!(health.status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_errored_extension_fails_status_check() {
        let h = harness();
        h.add_hooks(
            "blog",
            &[],
            Recorder::new("blog", &h.log).failing_on(LifecycleHook::Init),
        )
        .await;
        let _ = h.registry.start(&"blog".into()).await;

        let health = h
            .registry
            .monitor()
            .perform_health_check(&"blog".into())
            .await
            .unwrap();
        let status = health.checks.iter().find(|c| c.name == "status").unwrap();
        assert_eq!(status.status, CheckStatus::Fail);
        assert_eq!(health.score, 75);
        assert_eq!(health.status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_execute_counts_requests_and_errors() {
        let modules = NativeModules::new();
        modules.register(
            NativeModule::new("tools")
                .function("echo", |args, _| async move {
                    anyhow::Ok(args.into_iter().next().unwrap_or(Value::Null))
                })
                .function("boom", |_, _| async { Err::<Value, _>(anyhow::anyhow!("boom")) }),
        );
        let h = harness_with(modules, Duration::from_secs(2));
        h.add("blog", &[]).await;
        let id = ExtensionId::from("blog");

        let out = h.registry.execute(&id, "tools", "echo", vec![json!(7)]).await.unwrap();
        assert_eq!(out, json!(7));
        assert!(h.registry.execute(&id, "tools", "boom", vec![]).await.is_err());

        let metrics = h.registry.monitor().get_state(&id).unwrap().metrics;
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert!(metrics.last_activity.is_some());
    }

    // ── Extension manager ──────────────────────────────────────

    const HOOKS_SRC: &str = "export default { init() {} }";

    fn write_extension(root: &Path, name: &str, linchkit: Value) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("dist")).unwrap();
        std::fs::write(dir.join("dist/hooks.js"), HOOKS_SRC).unwrap();
        let package = json!({"name": name, "version": "1.0.0", "linchkit": linchkit});
        std::fs::write(
            dir.join("package.json"),
            serde_json::to_string_pretty(&package).unwrap(),
        )
        .unwrap();
        dir
    }

    struct ManagerHarness {
        h: Harness,
        manager: Arc<ExtensionManager>,
        gate: Arc<ConfirmationGate>,
        imports: Arc<AtomicUsize>,
    }

    fn manager_harness(root: &Path, names: &[&'static str]) -> ManagerHarness {
        let h = harness();
        let loader = StaticModuleLoader::new();
        let imports = Arc::new(AtomicUsize::new(0));
        for &name in names {
            let log = Arc::clone(&h.log);
            let imports = Arc::clone(&imports);
            loader.register(format!("{}/dist/hooks.js", name), move || {
                imports.fetch_add(1, Ordering::SeqCst);
                Arc::new(Recorder::new(name, &log)) as Arc<dyn ExtensionHooks>
            });
        }
        let gate = Arc::new(ConfirmationGate::new(Duration::from_secs(1)));
        let manager = Arc::new(ExtensionManager::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.permissions),
            Arc::clone(&gate),
            Arc::new(loader),
            ManagerSettings {
                extensions_dir: root.to_path_buf(),
                auto_start: true,
                auto_grant: false,
            },
        ));
        ManagerHarness {
            h,
            manager,
            gate,
            imports,
        }
    }

    fn hooks_entry() -> Value {
        json!({"hooks": "dist/hooks.js"})
    }

    #[tokio::test]
    async fn test_load_all_grants_registers_and_starts_in_dependency_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(
            tmp.path(),
            "blog",
            json!({
                "permissions": ["database:read", "database:write"],
                "entries": hooks_entry(),
                "dependencies": ["auth"]
            }),
        );
        write_extension(tmp.path(), "auth", json!({"entries": hooks_entry()}));
        std::fs::create_dir_all(tmp.path().join("not-an-extension")).unwrap();

        let m = manager_harness(tmp.path(), &["blog", "auth"]);
        let reports = m.manager.load_all().await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.result.is_ok()));
        assert_eq!(m.h.status("auth"), Some(ExtensionStatus::Running));
        assert_eq!(m.h.status("blog"), Some(ExtensionStatus::Running));
        assert!(m.h.permissions.has_grant(&"blog".into(), "database:write"));
        assert!(
            m.h.permissions
                .check_permission(&"blog".into(), "database:write", &Default::default())
                .await
        );
        let log = m.h.log();
        assert!(position(&log, "auth:ready") < position(&log, "blog:init"));
    }

    #[tokio::test]
    async fn test_missing_hooks_module_is_import_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "blog", json!({"entries": hooks_entry()}));
        let m = manager_harness(tmp.path(), &[]);
        let mut events = m.manager.subscribe();

        let err = m.manager.load_extension(&dir).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ImportFailed);
        assert!(!m.h.registry.is_registered(&"blog".into()));
        assert!(matches!(
            events.try_recv().unwrap(),
            ManagerEvent::ExtensionError { .. }
        ));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let good = write_extension(
            tmp.path(),
            "good",
            json!({
                "entries": hooks_entry(),
                "checksum": blake3::hash(HOOKS_SRC.as_bytes()).to_hex().to_string()
            }),
        );
        let bad = write_extension(
            tmp.path(),
            "bad",
            json!({"entries": hooks_entry(), "checksum": "deadbeef"}),
        );
        let m = manager_harness(tmp.path(), &["good", "bad"]);

        assert!(m.manager.load_extension(&good).await.is_ok());
        let err = m.manager.load_extension(&bad).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ImportFailed);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_missing_manifest_section_is_manifest_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plain");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), r#"{"name": "plain", "version": "1.0.0"}"#)
            .unwrap();
        let m = manager_harness(tmp.path(), &[]);

        let err = m.manager.load_extension(&dir).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ManifestNotFound);
    }

    #[tokio::test]
    async fn test_unconfirmed_permission_fails_load_and_revokes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(
            tmp.path(),
            "files",
            json!({"permissions": ["database:read", "filesystem:read"]}),
        );
        // nobody took the confirmation receiver, so the request is denied
        let m = manager_harness(tmp.path(), &[]);

        let err = m.manager.load_extension(&dir).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Extension files does not have permission: filesystem:read"
        );
        assert!(m.h.permissions.get_extension_grants(&"files".into()).is_empty());
        assert!(!m.h.registry.is_registered(&"files".into()));
    }

    #[tokio::test]
    async fn test_confirmed_permission_is_granted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "files", json!({"permissions": ["filesystem:read"]}));
        let m = manager_harness(tmp.path(), &[]);

        let mut requests = m.gate.take_receiver().unwrap();
        let responder = tokio::spawn(async move {
            let (request, reply) = requests.recv().await.unwrap();
            let _ = reply.send(ConfirmationResponse::Approved);
            request
        });

        m.manager.load_extension(&dir).await.unwrap();
        let request = responder.await.unwrap();
        assert_eq!(request.permission, "filesystem:read");
        assert!(m.h.permissions.has_grant(&"files".into(), "filesystem:read"));
    }

    #[tokio::test]
    async fn test_unknown_permission_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "odd", json!({"permissions": ["telepathy:read"]}));
        let m = manager_harness(tmp.path(), &[]);
        let err = m.manager.load_extension(&dir).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    // ── Reload ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reload_with_dependents_is_unload_failed() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "auth", json!({"entries": hooks_entry()}));
        write_extension(
            tmp.path(),
            "blog",
            json!({"entries": hooks_entry(), "dependencies": ["auth"]}),
        );
        let m = manager_harness(tmp.path(), &["auth", "blog"]);
        m.manager.load_all().await.unwrap();
        let imports_before = m.imports.load(Ordering::SeqCst);

        let err = m.manager.reload_extension(&"auth".into()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnloadFailed);
        assert_eq!(m.h.status("auth"), Some(ExtensionStatus::Running));
        // no register was attempted
        assert_eq!(m.imports.load(Ordering::SeqCst), imports_before);
    }

    #[tokio::test]
    async fn test_reload_replaces_instance_and_resets_state() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "blog", json!({"entries": hooks_entry()}));
        let m = manager_harness(tmp.path(), &["blog"]);
        m.manager.load_all().await.unwrap();
        let id = ExtensionId::from("blog");
        m.h.registry
            .monitor()
            .record_request(&id, Duration::from_millis(5), false);

        m.manager.reload_extension(&id).await.unwrap();

        assert_eq!(m.imports.load(Ordering::SeqCst), 2);
        assert_eq!(m.h.status("blog"), Some(ExtensionStatus::Running));
        let state = m.h.registry.monitor().get_state(&id).unwrap();
        assert_eq!(state.metrics.request_count, 0);
        let log = m.h.log();
        assert!(position(&log, "blog:destroy") < log.len() - 4);
    }

    #[tokio::test]
    async fn test_failed_reload_is_retried_after_the_fix() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "blog", json!({"entries": hooks_entry()}));
        let m = manager_harness(tmp.path(), &["blog"]);
        m.manager.load_all().await.unwrap();
        let id = ExtensionId::from("blog");
        let good = std::fs::read_to_string(dir.join("package.json")).unwrap();

        // saved halfway through an edit
        std::fs::write(dir.join("package.json"), "{ broken").unwrap();
        let err = m.manager.reload_extension(&id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationError);
        assert!(!m.h.registry.is_registered(&id));
        assert_eq!(m.manager.failed_reloads(), vec![id.clone()]);

        std::fs::write(dir.join("package.json"), good).unwrap();
        m.manager.reload_extension(&id).await.unwrap();
        assert_eq!(m.h.status("blog"), Some(ExtensionStatus::Running));
        assert!(m.manager.failed_reloads().is_empty());
        assert_eq!(m.manager.loaded_path(&id), Some(dir));
    }

    #[tokio::test]
    async fn test_unload_forgets_a_failed_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "blog", json!({"entries": hooks_entry()}));
        let m = manager_harness(tmp.path(), &["blog"]);
        m.manager.load_all().await.unwrap();
        let id = ExtensionId::from("blog");

        std::fs::write(dir.join("package.json"), "{ broken").unwrap();
        assert!(m.manager.reload_extension(&id).await.is_err());

        m.manager.unload_extension(&id).await.unwrap();
        assert!(m.manager.failed_reloads().is_empty());
        assert_eq!(
            m.manager.reload_extension(&id).await.unwrap_err().code(),
            ErrorCode::ExtensionNotFound
        );
    }

    #[tokio::test]
    async fn test_hot_reload_serializes_and_reports_failures() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "auth", json!({"entries": hooks_entry()}));
        write_extension(
            tmp.path(),
            "blog",
            json!({"entries": hooks_entry(), "dependencies": ["auth"]}),
        );
        let m = manager_harness(tmp.path(), &["auth", "blog"]);
        m.manager.load_all().await.unwrap();

        let coordinator =
            HotReloadCoordinator::new(m.manager.clone(), Duration::from_millis(20)).unwrap();
        let mut events = coordinator.subscribe();

        coordinator.request_reload("auth".into());
        coordinator.request_reload("blog".into());

        let mut finished = Vec::new();
        let mut running = 0usize;
        while finished.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ReloadEvent::Started { .. } => {
                    running += 1;
                    assert_eq!(running, 1, "two reloads ran at once");
                }
                ReloadEvent::Completed { extension_id, .. } => {
                    running -= 1;
                    finished.push((extension_id, None));
                }
                ReloadEvent::Failed {
                    extension_id,
                    error,
                } => {
                    running -= 1;
                    finished.push((extension_id, Some(error.code)));
                }
                ReloadEvent::Scheduled { .. } => {}
            }
        }
        finished.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(finished[0].0.as_str(), "auth");
        assert_eq!(finished[0].1, Some(ErrorCode::UnloadFailed));
        assert_eq!(finished[1].0.as_str(), "blog");
        assert_eq!(finished[1].1, None);
        assert_eq!(m.h.status("blog"), Some(ExtensionStatus::Running));

        coordinator.shutdown().await;
    }

    // ── Runtime root ───────────────────────────────────────────

    #[tokio::test]
    async fn test_runtime_loads_and_shuts_down() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "auth", json!({}));
        write_extension(tmp.path(), "blog", json!({"dependencies": ["auth"]}));

        let mut config = LinchConfig::default();
        config.extensions.dir = tmp.path().to_path_buf();
        let runtime = ExtensionRuntime::new(
            config,
            Arc::new(StaticModuleLoader::new()),
            Arc::new(NativeModules::new()),
        );
        runtime.start().unwrap();

        let reports = runtime.load_all().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.result.is_ok()));

        let results = runtime.shutdown().await;
        assert!(results.iter().all(BulkResult::success));
        let ids: Vec<&str> = results.iter().map(|r| r.extension_id.as_str()).collect();
        assert_eq!(ids, vec!["blog", "auth"]);
        for id in ["auth", "blog"] {
            assert_eq!(
                runtime.registry().status(&id.into()),
                Some(ExtensionStatus::Stopped)
            );
        }
    }
}
