use linch_config::SandboxConfig;
use linch_core::{EventBus, ExtensionId, LinchError, Result};
use linch_permission::{PermissionContext, PermissionEngine};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::execution::{ExecutionStatus, ExecutorStats, SandboxEvent, SandboxExecution};
use crate::globals::SandboxGlobals;
use crate::isolate::{CodeIsolate, ModuleHandle};
use crate::native::NativeFn;

/// A host function that may only run once the calling extension holds
/// every listed permission.
#[derive(Clone)]
pub struct SandboxedFunction {
    pub name: String,
    pub permissions: Vec<String>,
    pub execute: NativeFn,
}

impl SandboxedFunction {
    pub fn new(name: impl Into<String>, permissions: &[&str], execute: NativeFn) -> Self {
        Self {
            name: name.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            execute,
        }
    }
}

enum Outcome {
    Done(Result<Value>),
    TimedOut(u64),
    Stopped,
}

struct IsolateSlot {
    isolate: Box<dyn CodeIsolate>,
    compiled: HashMap<String, ModuleHandle>,
}

impl IsolateSlot {
    fn reset(&mut self) {
        self.compiled.clear();
        self.isolate.reset();
    }
}

/// Runs one extension's code under the configured limits and records every
/// execution.
///
/// In-flight executions listen on a shared cancellation token;
/// [`stop_all_executions`](Self::stop_all_executions) cancels it, finalizes
/// every running record as failed and swaps in a fresh token.
pub struct SandboxExecutor {
    extension: ExtensionId,
    config: SandboxConfig,
    globals: SandboxGlobals,
    permissions: Arc<PermissionEngine>,
    slot: AsyncMutex<IsolateSlot>,
    running: Mutex<HashMap<Uuid, SandboxExecution>>,
    history: Mutex<VecDeque<SandboxExecution>>,
    stats: Mutex<ExecutorStats>,
    cancel: Mutex<CancellationToken>,
    events: EventBus<SandboxEvent>,
}

impl SandboxExecutor {
    pub fn new(
        extension: ExtensionId,
        config: SandboxConfig,
        isolate: Box<dyn CodeIsolate>,
        globals: SandboxGlobals,
        permissions: Arc<PermissionEngine>,
    ) -> Self {
        debug!(
            extension = %extension,
            isolate = isolate.kind(),
            enabled = config.enabled,
            "creating sandbox executor"
        );
        Self {
            extension,
            config,
            globals,
            permissions,
            slot: AsyncMutex::new(IsolateSlot {
                isolate,
                compiled: HashMap::new(),
            }),
            running: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ExecutorStats::default()),
            cancel: Mutex::new(CancellationToken::new()),
            events: EventBus::new(256),
        }
    }

    pub fn extension(&self) -> &ExtensionId {
        &self.extension
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn globals(&self) -> &SandboxGlobals {
        &self.globals
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    fn call_timeout(&self) -> Option<Duration> {
        self.config
            .enabled
            .then(|| Duration::from_millis(self.config.timeout_ms))
    }

    // ── Execution ──────────────────────────────────────────────

    /// Compile `code` (cached by content hash) and run `function` in the isolate.
    ///
    /// With the sandbox disabled there is no timeout. A timeout discards and
    /// recreates the isolate.
    pub async fn execute_code(
        &self,
        code: impl AsRef<[u8]>,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let code = code.as_ref();
        let timeout = self.call_timeout();
        let globals = self.globals.clone();

        let run = async {
            let mut slot = self.slot.lock().await;
            let hash = blake3::hash(code).to_hex().to_string();
            let handle = match slot.compiled.get(&hash) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = slot.isolate.compile(code)?;
                    slot.compiled.insert(hash, handle.clone());
                    handle
                }
            };
            slot.isolate.run(&handle, function, args, globals).await
        };

        let (result, outcome_status) = self.record(function, timeout, run).await;
        if outcome_status == ExecutionStatus::Timeout {
            warn!(extension = %self.extension, function, "execution timed out, resetting isolate");
            self.slot.lock().await.reset();
        }
        result
    }

    /// Check every permission `f` declares, then run it.
    ///
    /// Fails with `PERMISSION_DENIED` naming the first missing permission;
    /// `f` is not invoked in that case.
    pub async fn execute_sandboxed_function(
        &self,
        f: &SandboxedFunction,
        args: Vec<Value>,
    ) -> Result<Value> {
        let context = PermissionContext::default().with("function", f.name.as_str());
        for permission in &f.permissions {
            self.permissions
                .require_permission(&self.extension, permission, &context)
                .await?;
        }

        let run = (f.execute)(args, self.globals.clone());
        let fut = async move { run.await.map_err(crate::native::from_guest_error) };
        let (result, _) = self.record(&f.name, self.call_timeout(), fut).await;
        result
    }

    /// Run a trusted in-process future (a lifecycle hook) with the same
    /// recording, timeout and cancellation as sandboxed code.
    pub async fn execute_task<T, F>(&self, name: &str, task: F, timeout: Option<Duration>) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let mut output = None;
        let fut = async {
            output = Some(task.await.map_err(LinchError::from)?);
            Ok::<Value, LinchError>(Value::Null)
        };
        let (result, _) = self.record(name, timeout, fut).await;
        result?;
        output.ok_or_else(|| LinchError::Sandbox(format!("task '{}' produced no output", name)))
    }

    async fn record<F>(
        &self,
        function: &str,
        timeout: Option<Duration>,
        fut: F,
    ) -> (Result<Value>, ExecutionStatus)
    where
        F: Future<Output = Result<Value>> + Send,
    {
        let execution = SandboxExecution::start(self.extension.clone(), function);
        let id = execution.id;
        self.running.lock().insert(id, execution.clone());
        debug!(extension = %self.extension, function, execution = %id, "execution started");
        self.events.publish(SandboxEvent::ExecutionStart(execution));

        let token = self.cancel.lock().clone();
        let outcome = tokio::select! {
            _ = token.cancelled() => Outcome::Stopped,
            outcome = with_timeout(timeout, fut) => outcome,
        };

        let memory = match self.slot.try_lock() {
            Ok(slot) => slot.isolate.memory_usage(),
            Err(_) => self.stats.lock().last_memory_bytes,
        };

        match outcome {
            Outcome::Done(Ok(value)) => {
                self.finish(id, ExecutionStatus::Completed, Some(value.clone()), None, memory);
                (Ok(value), ExecutionStatus::Completed)
            }
            Outcome::Done(Err(e)) => {
                self.finish(id, ExecutionStatus::Failed, None, Some(&e), memory);
                (Err(e), ExecutionStatus::Failed)
            }
            Outcome::TimedOut(timeout_ms) => {
                let e = LinchError::Timeout {
                    function: function.to_string(),
                    timeout_ms,
                };
                self.finish(id, ExecutionStatus::Timeout, None, Some(&e), memory);
                (Err(e), ExecutionStatus::Timeout)
            }
            Outcome::Stopped => {
                let e = stopped_error();
                self.finish(id, ExecutionStatus::Failed, None, Some(&e), memory);
                (Err(e), ExecutionStatus::Failed)
            }
        }
    }

    /// Move a running execution into history. No-op if it was already
    /// finalized by `stop_all_executions`.
    fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<&LinchError>,
        memory: u64,
    ) {
        let Some(mut execution) = self.running.lock().remove(&id) else {
            return;
        };
        execution.finish(status, result, error.map(LinchError::to_record), memory);
        self.archive(execution);
    }

    fn archive(&self, execution: SandboxExecution) {
        self.stats.lock().record(&execution);

        match execution.status {
            ExecutionStatus::Completed => {
                debug!(
                    extension = %self.extension,
                    function = %execution.function,
                    duration_ms = execution.resources.duration_ms,
                    "execution completed"
                );
            }
            _ => {
                warn!(
                    extension = %self.extension,
                    function = %execution.function,
                    status = ?execution.status,
                    error = ?execution.error.as_ref().map(|e| e.message.as_str()),
                    "execution failed"
                );
            }
        }

        let event = if execution.status == ExecutionStatus::Completed {
            SandboxEvent::ExecutionComplete(execution.clone())
        } else {
            SandboxEvent::ExecutionError(execution.clone())
        };

        if self.config.max_history > 0 {
            let mut history = self.history.lock();
            history.push_back(execution);
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
        self.events.publish(event);
    }

    // ── Control ────────────────────────────────────────────────

    /// Fail every in-flight execution and recreate the isolate.
    ///
    /// Returns the number of executions that were stopped. Afterwards no
    /// record is left in `running`.
    pub async fn stop_all_executions(&self) -> usize {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();

        let stopped: Vec<SandboxExecution> = self.running.lock().drain().map(|(_, e)| e).collect();
        let count = stopped.len();
        let error = stopped_error().to_record();
        for mut execution in stopped {
            execution.finish(ExecutionStatus::Failed, None, Some(error.clone()), 0);
            self.archive(execution);
        }

        self.slot.lock().await.reset();
        if count > 0 {
            info!(extension = %self.extension, count, "stopped running executions");
        }
        count
    }

    /// Stop everything and release the isolate's compiled state.
    pub async fn dispose(&self) {
        self.stop_all_executions().await;
        self.slot.lock().await.isolate.dispose();
        debug!(extension = %self.extension, "sandbox disposed");
    }

    // ── Introspection ──────────────────────────────────────────

    /// Finished executions, oldest first.
    pub fn history(&self) -> Vec<SandboxExecution> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn running(&self) -> Vec<SandboxExecution> {
        self.running.lock().values().cloned().collect()
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = *self.stats.lock();
        stats.running = self.running.lock().len();
        stats.total = stats.completed + stats.failed + stats.timeouts + stats.running as u64;
        stats
    }
}

fn stopped_error() -> LinchError {
    LinchError::Sandbox("stopped by sandbox".into())
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> Outcome
where
    F: Future<Output = Result<Value>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Outcome::Done(result),
            Err(_) => Outcome::TimedOut(limit.as_millis() as u64),
        },
        None => Outcome::Done(fut.await),
    }
}
