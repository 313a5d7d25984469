use async_trait::async_trait;
use linch_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::globals::SandboxGlobals;

/// A compiled unit of extension code, keyed by the blake3 hash of its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub hash: String,
    /// Human-readable label (module name, or a hash prefix for binary sources).
    pub name: String,
}

impl ModuleHandle {
    pub fn for_source(name: impl Into<String>, source: &[u8]) -> Self {
        Self {
            hash: blake3::hash(source).to_hex().to_string(),
            name: name.into(),
        }
    }
}

/// Limits applied to every isolate.
#[derive(Debug, Clone, Default)]
pub struct IsolateLimits {
    pub memory_limit_bytes: u64,
    /// Modules that may be compiled. Empty means no restriction.
    pub allowed_modules: Vec<String>,
}

impl IsolateLimits {
    pub fn allows(&self, module: &str) -> bool {
        self.allowed_modules.is_empty() || self.allowed_modules.iter().any(|m| m == module)
    }
}

/// An isolated execution context with no ambient access to host state.
///
/// The only way out is through the [`SandboxGlobals`] passed to `run`.
/// Implementations must be cheap to [`reset`](CodeIsolate::reset): the
/// executor discards the context after every timeout.
#[async_trait]
pub trait CodeIsolate: Send {
    /// Short name of the isolation technology, for logs.
    fn kind(&self) -> &'static str;

    fn compile(&mut self, source: &[u8]) -> Result<ModuleHandle>;

    async fn run(
        &mut self,
        module: &ModuleHandle,
        function: &str,
        args: Vec<Value>,
        globals: SandboxGlobals,
    ) -> Result<Value>;

    /// Bytes currently attributed to this isolate.
    fn memory_usage(&self) -> u64;

    /// Drop every compiled module and all per-run state.
    fn dispose(&mut self);

    /// Discard and recreate the context. Defaults to `dispose`.
    fn reset(&mut self) {
        self.dispose();
    }
}
