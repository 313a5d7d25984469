use async_trait::async_trait;
use linch_core::{LinchError, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use wasmtime::*;

use crate::globals::{CONSOLE, ConsoleLevel, EVENTS, STORAGE, SandboxGlobals};
use crate::isolate::{CodeIsolate, IsolateLimits, ModuleHandle};

/// Import module under which host functions are exposed.
pub const HOST_MODULE: &str = "linch";

/// Instructions between cooperative yields, so an executor timeout can
/// interrupt a guest that never returns.
const FUEL_YIELD_INTERVAL: u64 = 10_000;

struct HostState {
    globals: SandboxGlobals,
    limits: StoreLimits,
    /// Typed error raised by the last failing host call; the guest only sees a trap.
    raised: Option<LinchError>,
}

/// WebAssembly isolate backed by wasmtime.
///
/// ## ABI
///
/// - `memory`: exported linear memory
/// - `linch_malloc(size: u32) -> u32`: allocate guest bytes
/// - `<function>(ptr: u32, len: u32) -> u64`: input is a JSON array of
///   arguments at `ptr`; the result is `(result_ptr << 32) | result_len`
///   pointing at JSON
/// - `<function>() -> i32 | i64 | ()`: no-argument functions returning a
///   plain number or nothing are also accepted
///
/// Host imports (module `linch`), each linked only if its global is reachable:
///
/// - `log(level: i32, ptr: u32, len: u32)`: `console`
/// - `storage_get(key_ptr, key_len, out_ptr, out_cap) -> i32`: `storage`;
///   writes the JSON value if it fits and returns its full length
/// - `storage_set(key_ptr, key_len, val_ptr, val_len)`: `storage`
/// - `emit(name_ptr, name_len, payload_ptr, payload_len)`: `events`
pub struct WasmIsolate {
    engine: Engine,
    modules: HashMap<String, Module>,
    limits: IsolateLimits,
    last_memory: u64,
}

impl WasmIsolate {
    pub fn new(limits: IsolateLimits) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);

        let engine = Engine::new(&config)
            .map_err(|e| LinchError::Sandbox(format!("failed to create WASM engine: {}", e)))?;

        Ok(Self {
            engine,
            modules: HashMap::new(),
            limits,
            last_memory: 0,
        })
    }
}

fn host_global(import: &str) -> Option<&'static str> {
    match import {
        "log" => Some(CONSOLE),
        "storage_get" | "storage_set" => Some(STORAGE),
        "emit" => Some(EVENTS),
        _ => None,
    }
}

fn sandbox_err(context: &str, e: impl std::fmt::Display) -> LinchError {
    LinchError::Sandbox(format!("{}: {}", context, e))
}

#[async_trait]
impl CodeIsolate for WasmIsolate {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    fn compile(&mut self, source: &[u8]) -> Result<ModuleHandle> {
        let label = if source.starts_with(b"\0asm") { "wasm" } else { "wat" };
        let mut handle = ModuleHandle::for_source(label, source);
        handle.name = format!("{}:{}", label, &handle.hash[..12]);

        if self.modules.contains_key(&handle.hash) {
            debug!(module = %handle.name, "wasm module already compiled");
            return Ok(handle);
        }

        let module = Module::new(&self.engine, source)
            .map_err(|e| sandbox_err("failed to compile wasm", e))?;

        for import in module.imports() {
            if import.module() != HOST_MODULE {
                return Err(LinchError::Sandbox(format!(
                    "import module '{}' is not available",
                    import.module()
                )));
            }
            if !self.limits.allows(HOST_MODULE) {
                return Err(LinchError::Sandbox(format!(
                    "module '{}' is not in allowed_modules",
                    HOST_MODULE
                )));
            }
            if host_global(import.name()).is_none() {
                return Err(LinchError::Sandbox(format!(
                    "unknown host function '{}'",
                    import.name()
                )));
            }
        }

        self.modules.insert(handle.hash.clone(), module);
        Ok(handle)
    }

    async fn run(
        &mut self,
        handle: &ModuleHandle,
        function: &str,
        args: Vec<Value>,
        globals: SandboxGlobals,
    ) -> Result<Value> {
        let module = self
            .modules
            .get(&handle.hash)
            .cloned()
            .ok_or_else(|| LinchError::Sandbox(format!("module '{}' is not compiled", handle.name)))?;

        for import in module.imports() {
            if let Some(global) = host_global(import.name()) {
                if !globals.is_available(global) {
                    return Err(LinchError::GlobalUnavailable(global.to_string()));
                }
            }
        }

        let mut limits = StoreLimitsBuilder::new();
        if self.limits.memory_limit_bytes > 0 {
            limits = limits.memory_size(self.limits.memory_limit_bytes as usize);
        }
        let mut store = Store::new(
            &self.engine,
            HostState {
                globals: globals.clone(),
                limits: limits.build(),
                raised: None,
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(u64::MAX)
            .map_err(|e| sandbox_err("failed to set fuel", e))?;
        store
            .fuel_async_yield_interval(Some(FUEL_YIELD_INTERVAL))
            .map_err(|e| sandbox_err("failed to set yield interval", e))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        link_host_functions(&mut linker, &globals)?;

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| sandbox_err("failed to instantiate wasm module", e))?;

        let outcome = invoke(&mut store, &instance, function, &args).await;
        self.last_memory = instance
            .get_memory(&mut store, "memory")
            .map(|m| m.data_size(&store) as u64)
            .unwrap_or(0);

        match outcome {
            Ok(value) => Ok(value),
            Err(e) => Err(store.data_mut().raised.take().unwrap_or(e)),
        }
    }

    fn memory_usage(&self) -> u64 {
        self.last_memory
    }

    fn dispose(&mut self) {
        self.modules.clear();
        self.last_memory = 0;
    }
}

async fn invoke(
    store: &mut Store<HostState>,
    instance: &Instance,
    function: &str,
    args: &[Value],
) -> Result<Value> {
    let trap = |e: Error| sandbox_err(&format!("'{}' trapped", function), e);

    if let Ok(func) = instance.get_typed_func::<(u32, u32), u64>(&mut *store, function) {
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| LinchError::Sandbox("module does not export 'memory'".into()))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut *store, "linch_malloc")
            .map_err(|e| sandbox_err("missing export 'linch_malloc'", e))?;

        let input = serde_json::to_vec(args)?;
        let ptr = malloc
            .call_async(&mut *store, input.len() as u32)
            .await
            .map_err(trap)?;
        memory
            .write(&mut *store, ptr as usize, &input)
            .map_err(|e| sandbox_err("input exceeds guest memory bounds", e))?;

        let packed = func
            .call_async(&mut *store, (ptr, input.len() as u32))
            .await
            .map_err(trap)?;
        let result_ptr = (packed >> 32) as usize;
        let result_len = (packed & 0xFFFF_FFFF) as usize;

        let mut out = vec![0u8; result_len];
        memory
            .read(&*store, result_ptr, &mut out)
            .map_err(|e| sandbox_err("result exceeds guest memory bounds", e))?;
        return serde_json::from_slice(&out)
            .map_err(|e| sandbox_err("invalid JSON returned by guest", e));
    }

    if let Ok(func) = instance.get_typed_func::<(), i64>(&mut *store, function) {
        let n = func.call_async(&mut *store, ()).await.map_err(trap)?;
        return Ok(Value::from(n));
    }
    if let Ok(func) = instance.get_typed_func::<(), i32>(&mut *store, function) {
        let n = func.call_async(&mut *store, ()).await.map_err(trap)?;
        return Ok(Value::from(n));
    }
    if let Ok(func) = instance.get_typed_func::<(), ()>(&mut *store, function) {
        func.call_async(&mut *store, ()).await.map_err(trap)?;
        return Ok(Value::Null);
    }

    Err(LinchError::Sandbox(format!(
        "function '{}' is not exported with a supported signature",
        function
    )))
}

// ── Host functions ─────────────────────────────────────────────

fn link_host_functions(linker: &mut Linker<HostState>, globals: &SandboxGlobals) -> Result<()> {
    let link_err = |e: Error| sandbox_err("failed to link host function", e);

    if globals.is_available(CONSOLE) {
        linker
            .func_wrap(
                HOST_MODULE,
                "log",
                |mut caller: Caller<'_, HostState>, level: i32, ptr: u32, len: u32| {
                    host_log(&mut caller, level, ptr, len)
                },
            )
            .map_err(link_err)?;
    }

    if globals.is_available(STORAGE) {
        linker
            .func_wrap_async(
                HOST_MODULE,
                "storage_get",
                |mut caller: Caller<'_, HostState>,
                 (key_ptr, key_len, out_ptr, out_cap): (u32, u32, u32, u32)| {
                    Box::new(async move {
                        host_storage_get(&mut caller, key_ptr, key_len, out_ptr, out_cap).await
                    })
                },
            )
            .map_err(link_err)?;
        linker
            .func_wrap_async(
                HOST_MODULE,
                "storage_set",
                |mut caller: Caller<'_, HostState>,
                 (key_ptr, key_len, val_ptr, val_len): (u32, u32, u32, u32)| {
                    Box::new(async move {
                        host_storage_set(&mut caller, key_ptr, key_len, val_ptr, val_len).await
                    })
                },
            )
            .map_err(link_err)?;
    }

    if globals.is_available(EVENTS) {
        linker
            .func_wrap_async(
                HOST_MODULE,
                "emit",
                |mut caller: Caller<'_, HostState>,
                 (name_ptr, name_len, payload_ptr, payload_len): (u32, u32, u32, u32)| {
                    Box::new(async move {
                        host_emit(&mut caller, name_ptr, name_len, payload_ptr, payload_len).await
                    })
                },
            )
            .map_err(link_err)?;
    }

    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| Error::msg("guest does not export 'memory'"))
}

fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> wasmtime::Result<String> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&*caller, ptr as usize, &mut buf)
        .map_err(|e| Error::msg(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| Error::msg(e.to_string()))
}

/// Remember the typed error and turn it into a trap.
fn raise(caller: &mut Caller<'_, HostState>, err: LinchError) -> Error {
    let msg = err.to_string();
    caller.data_mut().raised = Some(err);
    Error::msg(msg)
}

fn host_log(caller: &mut Caller<'_, HostState>, level: i32, ptr: u32, len: u32) -> wasmtime::Result<()> {
    let message = read_guest_str(caller, ptr, len)?;
    let level = match level {
        0 => ConsoleLevel::Debug,
        1 => ConsoleLevel::Info,
        2 => ConsoleLevel::Warn,
        _ => ConsoleLevel::Error,
    };
    let globals = caller.data().globals.clone();
    globals.log(level, &message).map_err(|e| raise(caller, e))
}

async fn host_storage_get(
    caller: &mut Caller<'_, HostState>,
    key_ptr: u32,
    key_len: u32,
    out_ptr: u32,
    out_cap: u32,
) -> wasmtime::Result<i32> {
    let key = read_guest_str(caller, key_ptr, key_len)?;
    let globals = caller.data().globals.clone();
    let value = match globals.storage_get(&key).await {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => return Err(raise(caller, e)),
    };

    let bytes = value.to_string().into_bytes();
    if bytes.len() <= out_cap as usize {
        let memory = guest_memory(caller)?;
        memory
            .write(&mut *caller, out_ptr as usize, &bytes)
            .map_err(|e| Error::msg(e.to_string()))?;
    }
    Ok(bytes.len() as i32)
}

async fn host_storage_set(
    caller: &mut Caller<'_, HostState>,
    key_ptr: u32,
    key_len: u32,
    val_ptr: u32,
    val_len: u32,
) -> wasmtime::Result<()> {
    let key = read_guest_str(caller, key_ptr, key_len)?;
    let raw = read_guest_str(caller, val_ptr, val_len)?;
    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    let globals = caller.data().globals.clone();
    match globals.storage_set(&key, value).await {
        Ok(()) => Ok(()),
        Err(e) => Err(raise(caller, e)),
    }
}

async fn host_emit(
    caller: &mut Caller<'_, HostState>,
    name_ptr: u32,
    name_len: u32,
    payload_ptr: u32,
    payload_len: u32,
) -> wasmtime::Result<()> {
    let name = read_guest_str(caller, name_ptr, name_len)?;
    let raw = read_guest_str(caller, payload_ptr, payload_len)?;
    let payload = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    let globals = caller.data().globals.clone();
    match globals.emit(&name, payload).await {
        Ok(()) => Ok(()),
        Err(e) => Err(raise(caller, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{EventHub, SharedStore};
    use linch_config::schema::default_blocked_globals;
    use linch_permission::PermissionEngine;
    use std::sync::Arc;

    fn globals(blocked: &[String]) -> SandboxGlobals {
        SandboxGlobals::restricted(
            "w".into(),
            Arc::new(PermissionEngine::with_builtin_policies(
                std::time::Duration::from_secs(60),
            )),
            SharedStore::new(),
            EventHub::new(),
            blocked,
            false,
            false,
        )
    }

    #[tokio::test]
    async fn runs_numeric_export() {
        let mut iso = WasmIsolate::new(IsolateLimits::default()).unwrap();
        let handle = iso
            .compile(br#"(module (func (export "answer") (result i32) i32.const 42))"#)
            .unwrap();
        let out = iso
            .run(&handle, "answer", vec![], globals(&default_blocked_globals()))
            .await
            .unwrap();
        assert_eq!(out, Value::from(42));
    }

    #[test]
    fn rejects_foreign_imports() {
        let mut iso = WasmIsolate::new(IsolateLimits::default()).unwrap();
        let err = iso
            .compile(br#"(module (import "env" "exit" (func)))"#)
            .unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[tokio::test]
    async fn blocked_import_is_unavailable() {
        let mut iso = WasmIsolate::new(IsolateLimits::default()).unwrap();
        let handle = iso
            .compile(
                br#"(module
                    (import "linch" "log" (func $log (param i32 i32 i32)))
                    (memory (export "memory") 1)
                    (func (export "main") i32.const 1 i32.const 0 i32.const 0 call $log))"#,
            )
            .unwrap();
        let err = iso
            .run(&handle, "main", vec![], globals(&["console".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, LinchError::GlobalUnavailable(g) if g == "console"));
    }

    #[tokio::test]
    async fn denied_host_call_surfaces_permission_error() {
        let mut iso = WasmIsolate::new(IsolateLimits::default()).unwrap();
        let handle = iso
            .compile(
                br#"(module
                    (import "linch" "storage_set" (func $set (param i32 i32 i32 i32)))
                    (memory (export "memory") 1)
                    (data (i32.const 0) "k1")
                    (func (export "main")
                        i32.const 0 i32.const 1 i32.const 0 i32.const 2 call $set))"#,
            )
            .unwrap();
        let err = iso
            .run(&handle, "main", vec![], globals(&[]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Extension w does not have permission: database:write"
        );
    }
}
