//! # linch-runtime
//!
//! Extension lifecycle orchestration on top of the permission engine and the
//! sandbox:
//!
//! - [`LifecycleRegistry`] registers extensions and starts/stops them along
//!   their dependency graph, with cycle detection before any hook runs.
//! - [`StateMonitor`] keeps metrics and a health score per extension.
//! - [`ExtensionManager`] loads extension directories (manifest, hooks
//!   import, permission grants) and [`HotReloadCoordinator`] reloads them
//!   on file changes, one at a time.
//! - [`ExtensionRuntime`] wires all of it together from a [`LinchConfig`](linch_config::LinchConfig).

pub mod context;
pub mod extension;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod monitor;
pub mod registry;
pub mod reload;
pub mod runtime;

pub use context::{ExtensionContext, ExtensionEvents, ExtensionLogger, ExtensionStorage, ListenerId};
pub use extension::{
    Capabilities, Entries, Extension, ExtensionHooks, ExtensionMetadata, ExtensionStatus,
    LifecycleHook, NoopHooks,
};
pub use instance::ExtensionInstance;
pub use loader::{HooksFactory, ImportOutcome, ModuleLoader, StaticModuleLoader};
pub use manager::{ExtensionManager, LoadReport, ManagerEvent, ManagerSettings};
pub use manifest::{ExtensionManifest, LinchkitSection, MANIFEST_FILE};
pub use monitor::{
    CheckStatus, ExtensionHealth, ExtensionMetrics, ExtensionState, HealthCheck, HealthStatus,
    HealthResponse, MetricsSample, MetricsSource, MonitorEvent, StateMonitor,
};
pub use registry::{BulkResult, LifecycleEvent, LifecycleRegistry, RegistrationInfo};
pub use reload::{HotReloadCoordinator, ReloadEvent, Reloader};
pub use runtime::ExtensionRuntime;
