use async_trait::async_trait;
use futures::future::BoxFuture;
use linch_core::{LinchError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::globals::SandboxGlobals;
use crate::isolate::{CodeIsolate, IsolateLimits, ModuleHandle};

/// A host-compiled function callable from the sandbox.
pub type NativeFn =
    Arc<dyn Fn(Vec<Value>, SandboxGlobals) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`NativeFn`].
pub fn native_fn<F, Fut>(f: F) -> NativeFn
where
    F: Fn(Vec<Value>, SandboxGlobals) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(
        move |args: Vec<Value>, globals: SandboxGlobals| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(f(args, globals))
        },
    )
}

/// A named set of native functions.
#[derive(Clone, Default)]
pub struct NativeModule {
    pub name: String,
    functions: HashMap<String, NativeFn>,
}

impl NativeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
        }
    }

    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, SandboxGlobals) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.functions.insert(name.into(), native_fn(f));
        self
    }

    pub fn get(&self, function: &str) -> Option<NativeFn> {
        self.functions.get(function).cloned()
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Catalogue of native modules, shared by every [`NativeIsolate`].
#[derive(Clone, Default)]
pub struct NativeModules {
    inner: Arc<RwLock<HashMap<String, NativeModule>>>,
}

impl NativeModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: NativeModule) {
        debug!(module = %module.name, "registering native module");
        self.inner.write().insert(module.name.clone(), module);
    }

    pub fn get(&self, name: &str) -> Option<NativeModule> {
        self.inner.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Isolate backed by native Rust modules.
///
/// The "source" handed to `compile` is the module name. Functions only see
/// the globals they are given, so the boundary is the [`SandboxGlobals`]
/// API rather than memory isolation.
pub struct NativeIsolate {
    catalogue: NativeModules,
    compiled: HashMap<String, String>,
    limits: IsolateLimits,
    last_memory: u64,
}

impl NativeIsolate {
    pub fn new(catalogue: NativeModules, limits: IsolateLimits) -> Self {
        Self {
            catalogue,
            compiled: HashMap::new(),
            limits,
            last_memory: 0,
        }
    }
}

#[async_trait]
impl CodeIsolate for NativeIsolate {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn compile(&mut self, source: &[u8]) -> Result<ModuleHandle> {
        let name = std::str::from_utf8(source)
            .map_err(|_| LinchError::Sandbox("native module name is not UTF-8".into()))?
            .trim();

        if !self.limits.allows(name) {
            return Err(LinchError::Sandbox(format!(
                "module '{}' is not in allowed_modules",
                name
            )));
        }
        if self.catalogue.get(name).is_none() {
            return Err(LinchError::Sandbox(format!(
                "no native module named '{}'",
                name
            )));
        }

        let handle = ModuleHandle::for_source(name, name.as_bytes());
        self.compiled.insert(handle.hash.clone(), name.to_string());
        Ok(handle)
    }

    async fn run(
        &mut self,
        module: &ModuleHandle,
        function: &str,
        args: Vec<Value>,
        globals: SandboxGlobals,
    ) -> Result<Value> {
        let name = self
            .compiled
            .get(&module.hash)
            .ok_or_else(|| LinchError::Sandbox(format!("module '{}' is not compiled", module.name)))?;
        let f = self
            .catalogue
            .get(name)
            .and_then(|m| m.get(function))
            .ok_or_else(|| {
                LinchError::Sandbox(format!("function '{}' not found in '{}'", function, name))
            })?;

        let value = f(args, globals).await.map_err(from_guest_error)?;

        let size = serde_json::to_vec(&value)?.len() as u64;
        self.last_memory = size;
        if self.limits.memory_limit_bytes > 0 && size > self.limits.memory_limit_bytes {
            return Err(LinchError::Sandbox(format!(
                "memory limit exceeded: {} > {} bytes",
                size, self.limits.memory_limit_bytes
            )));
        }
        Ok(value)
    }

    fn memory_usage(&self) -> u64 {
        self.last_memory
    }

    fn dispose(&mut self) {
        self.compiled.clear();
        self.last_memory = 0;
    }
}

/// Keep typed errors (permission denials, missing globals) raised by host
/// calls inside the guest; everything else becomes a sandbox error.
pub(crate) fn from_guest_error(e: anyhow::Error) -> LinchError {
    match e.downcast::<LinchError>() {
        Ok(err) => err,
        Err(e) => LinchError::Sandbox(format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{EventHub, SharedStore};
    use linch_permission::PermissionEngine;
    use serde_json::json;

    fn globals() -> SandboxGlobals {
        SandboxGlobals::unrestricted(
            "x".into(),
            Arc::new(PermissionEngine::default()),
            SharedStore::new(),
            EventHub::new(),
        )
    }

    fn catalogue() -> NativeModules {
        let modules = NativeModules::new();
        modules.register(NativeModule::new("math").function("add", |args, _| async move {
            let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
            anyhow::Ok(json!(sum))
        }));
        modules
    }

    #[tokio::test]
    async fn compile_and_run() {
        let mut iso = NativeIsolate::new(catalogue(), IsolateLimits::default());
        let handle = iso.compile(b"math").unwrap();
        let out = iso
            .run(&handle, "add", vec![json!(2), json!(3)], globals())
            .await
            .unwrap();
        assert_eq!(out, json!(5));
        assert!(iso.memory_usage() > 0);
    }

    #[test]
    fn allowed_modules_restrict_compile() {
        let limits = IsolateLimits {
            allowed_modules: vec!["other".into()],
            ..Default::default()
        };
        let mut iso = NativeIsolate::new(catalogue(), limits);
        assert!(iso.compile(b"math").is_err());
    }

    #[tokio::test]
    async fn dispose_forgets_compiled_modules() {
        let mut iso = NativeIsolate::new(catalogue(), IsolateLimits::default());
        let handle = iso.compile(b"math").unwrap();
        iso.dispose();
        assert!(iso.run(&handle, "add", vec![], globals()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_result_exceeds_memory_limit() {
        let limits = IsolateLimits {
            memory_limit_bytes: 4,
            ..Default::default()
        };
        let modules = NativeModules::new();
        modules.register(
            NativeModule::new("big")
                .function("blob", |_, _| async { anyhow::Ok(json!("x".repeat(64))) }),
        );
        let mut iso = NativeIsolate::new(modules, limits);
        let handle = iso.compile(b"big").unwrap();
        let err = iso.run(&handle, "blob", vec![], globals()).await.unwrap_err();
        assert!(err.to_string().contains("memory limit"));
    }
}
