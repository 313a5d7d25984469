use linch_config::LinchConfig;
use linch_core::Result;
use linch_permission::{ConfirmationGate, PermissionEngine};
use linch_sandbox::{EventHub, IsolateFactory, SandboxEnvironment, SharedStore};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::loader::ModuleLoader;
use crate::manager::{ExtensionManager, LoadReport, ManagerSettings};
use crate::monitor::StateMonitor;
use crate::registry::{BulkResult, LifecycleRegistry};
use crate::reload::{HotReloadCoordinator, Reloader};

/// Root object: builds every component once from [`LinchConfig`] and owns
/// their lifetimes.
pub struct ExtensionRuntime {
    config: LinchConfig,
    permissions: Arc<PermissionEngine>,
    confirmation: Arc<ConfirmationGate>,
    monitor: Arc<StateMonitor>,
    registry: Arc<LifecycleRegistry>,
    manager: Arc<ExtensionManager>,
    reload: RwLock<Option<Arc<HotReloadCoordinator>>>,
    store: SharedStore,
    hub: EventHub,
}

impl ExtensionRuntime {
    pub fn new(
        config: LinchConfig,
        loader: Arc<dyn ModuleLoader>,
        isolates: Arc<dyn IsolateFactory>,
    ) -> Self {
        let permissions = Arc::new(PermissionEngine::with_builtin_policies(
            Duration::from_secs(config.permissions.cache_ttl_secs),
        ));
        let confirmation = Arc::new(ConfirmationGate::new(Duration::from_secs(
            config.permissions.confirmation_timeout_secs,
        )));
        let store = SharedStore::new();
        let hub = EventHub::new();

        let sandbox = SandboxEnvironment {
            config: config.sandbox.clone(),
            permissions: Arc::clone(&permissions),
            store: store.clone(),
            hub: hub.clone(),
            isolates,
        };
        let monitor = Arc::new(StateMonitor::new(config.monitor.clone()));
        let registry = LifecycleRegistry::new(
            sandbox,
            Arc::clone(&monitor),
            Duration::from_millis(config.extensions.hook_timeout_ms),
        );
        let manager = Arc::new(ExtensionManager::new(
            Arc::clone(&registry),
            Arc::clone(&permissions),
            Arc::clone(&confirmation),
            loader,
            ManagerSettings::from_config(&config),
        ));

        Self {
            config,
            permissions,
            confirmation,
            monitor,
            registry,
            manager,
            reload: RwLock::new(None),
            store,
            hub,
        }
    }

    /// Spawn the monitor sweeps and, when enabled, the hot-reload worker.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.monitor.start();
        if self.config.hot_reload.enabled && self.reload.read().is_none() {
            let reloader: Arc<dyn Reloader> = self.manager.clone();
            let coordinator = HotReloadCoordinator::new(
                reloader,
                Duration::from_millis(self.config.hot_reload.debounce_ms),
            )?;
            *self.reload.write() = Some(coordinator);
        }
        info!(
            extensions_dir = %self.config.extensions.dir.display(),
            sandbox = self.config.sandbox.enabled,
            hot_reload = self.config.hot_reload.enabled,
            "extension runtime started"
        );
        Ok(())
    }

    /// Load everything in the extensions directory and watch what loaded.
    pub async fn load_all(&self) -> Result<Vec<LoadReport>> {
        let reports = self.manager.load_all().await?;
        let reload = self.reload.read().clone();
        if let Some(reload) = reload {
            for report in &reports {
                if let Ok(id) = &report.result
                    && let Err(e) = reload.watch(&report.path, id.clone())
                {
                    warn!(extension = %id, error = %e, "hot reload watch failed");
                }
            }
        }
        Ok(reports)
    }

    /// Stop hot reload, stop every extension (dependents first) and cancel
    /// the monitor loops.
    pub async fn shutdown(&self) -> Vec<BulkResult> {
        let reload = self.reload.write().take();
        if let Some(reload) = reload {
            reload.shutdown().await;
        }
        let results = self.registry.stop_all().await;
        self.monitor.shutdown().await;
        let failed = results.iter().filter(|r| !r.success()).count();
        info!(stopped = results.len() - failed, failed, "extension runtime shut down");
        results
    }

    pub fn config(&self) -> &LinchConfig {
        &self.config
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    pub fn confirmation(&self) -> &Arc<ConfirmationGate> {
        &self.confirmation
    }

    pub fn monitor(&self) -> &Arc<StateMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ExtensionManager> {
        &self.manager
    }

    pub fn hot_reload(&self) -> Option<Arc<HotReloadCoordinator>> {
        self.reload.read().clone()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }
}
