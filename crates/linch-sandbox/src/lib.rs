//! # linch-sandbox
//!
//! Executes extension code inside an isolate with no ambient access to the
//! host. The isolate technology is pluggable through [`CodeIsolate`]:
//! [`NativeIsolate`] runs host-compiled Rust modules, and `WasmIsolate`
//! (feature `wasm`) runs WebAssembly under wasmtime with fuel and memory
//! limits.
//!
//! Everything extension code can reach goes through [`SandboxGlobals`],
//! which proxies storage, events, network and filesystem access through the
//! permission engine.

pub mod execution;
pub mod executor;
pub mod factory;
pub mod globals;
pub mod isolate;
pub mod native;
pub mod shared;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use execution::{ExecutionStatus, ExecutorStats, ResourceUsage, SandboxEvent, SandboxExecution};
pub use executor::{SandboxExecutor, SandboxedFunction};
#[cfg(feature = "wasm")]
pub use factory::WasmIsolateFactory;
pub use factory::{IsolateFactory, SandboxEnvironment};
pub use globals::{ConsoleLevel, FetchRequest, FetchResponse, SandboxGlobals};
pub use isolate::{CodeIsolate, IsolateLimits, ModuleHandle};
pub use native::{NativeFn, NativeIsolate, NativeModule, NativeModules, native_fn};
pub use shared::{EventHub, HubEvent, SharedStore};
#[cfg(feature = "wasm")]
pub use wasm::WasmIsolate;
