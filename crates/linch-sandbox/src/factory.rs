use linch_config::SandboxConfig;
use linch_core::{ExtensionId, Result};
use linch_permission::PermissionEngine;
use std::sync::Arc;

use crate::executor::SandboxExecutor;
use crate::globals::SandboxGlobals;
use crate::isolate::{CodeIsolate, IsolateLimits};
use crate::native::{NativeIsolate, NativeModules};
use crate::shared::{EventHub, SharedStore};

/// Creates one isolate per extension.
pub trait IsolateFactory: Send + Sync {
    fn create(&self, extension: &ExtensionId, limits: IsolateLimits) -> Result<Box<dyn CodeIsolate>>;
}

impl IsolateFactory for NativeModules {
    fn create(&self, _extension: &ExtensionId, limits: IsolateLimits) -> Result<Box<dyn CodeIsolate>> {
        Ok(Box::new(NativeIsolate::new(self.clone(), limits)))
    }
}

/// Factory for [`WasmIsolate`](crate::wasm::WasmIsolate)s.
#[cfg(feature = "wasm")]
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmIsolateFactory;

#[cfg(feature = "wasm")]
impl IsolateFactory for WasmIsolateFactory {
    fn create(&self, _extension: &ExtensionId, limits: IsolateLimits) -> Result<Box<dyn CodeIsolate>> {
        Ok(Box::new(crate::wasm::WasmIsolate::new(limits)?))
    }
}

impl From<&SandboxConfig> for IsolateLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_mb * 1024 * 1024,
            allowed_modules: config.allowed_modules.clone(),
        }
    }
}

/// Everything needed to build per-extension executors.
#[derive(Clone)]
pub struct SandboxEnvironment {
    pub config: SandboxConfig,
    pub permissions: Arc<PermissionEngine>,
    pub store: SharedStore,
    pub hub: EventHub,
    pub isolates: Arc<dyn IsolateFactory>,
}

impl SandboxEnvironment {
    /// Build the executor for one extension. A disabled sandbox gets
    /// unrestricted globals.
    pub fn executor_for(&self, extension: &ExtensionId) -> Result<SandboxExecutor> {
        let isolate = self
            .isolates
            .create(extension, IsolateLimits::from(&self.config))?;

        let globals = if self.config.enabled {
            SandboxGlobals::restricted(
                extension.clone(),
                Arc::clone(&self.permissions),
                self.store.clone(),
                self.hub.clone(),
                &self.config.blocked_globals,
                self.config.allow_network_access,
                self.config.allow_file_system_access,
            )
        } else {
            SandboxGlobals::unrestricted(
                extension.clone(),
                Arc::clone(&self.permissions),
                self.store.clone(),
                self.hub.clone(),
            )
        };

        Ok(SandboxExecutor::new(
            extension.clone(),
            self.config.clone(),
            isolate,
            globals,
            Arc::clone(&self.permissions),
        ))
    }
}
