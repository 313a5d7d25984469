use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use linch_core::{ErrorRecord, EventBus, ExtensionId, LinchError, Result};
use linch_sandbox::SandboxEnvironment;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

use crate::context::ExtensionContext;
use crate::extension::{Extension, ExtensionMetadata, ExtensionStatus, LifecycleHook};
use crate::instance::ExtensionInstance;
use crate::monitor::{HealthResponse, MetricsSample, MetricsSource, StateMonitor};

/// Events published by the [`LifecycleRegistry`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Registered {
        extension: ExtensionMetadata,
    },
    Unregistered {
        extension_id: ExtensionId,
    },
    Started {
        extension_id: ExtensionId,
        extension: ExtensionMetadata,
    },
    Stopped {
        extension_id: ExtensionId,
        extension: ExtensionMetadata,
    },
    Error {
        extension_id: ExtensionId,
        error: ErrorRecord,
    },
}

/// Outcome of one item of a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkResult {
    pub extension_id: ExtensionId,
    pub result: std::result::Result<(), ErrorRecord>,
}

impl BulkResult {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Read-only snapshot of one registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationInfo {
    pub metadata: ExtensionMetadata,
    pub status: ExtensionStatus,
    pub error: Option<ErrorRecord>,
    pub config: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

struct Registration {
    /// Registration order. Timestamps can tie within one clock tick.
    seq: u64,
    instance: Arc<ExtensionInstance>,
    status: ExtensionStatus,
    error: Option<ErrorRecord>,
    registered_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl Registration {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.instance.extension.metadata
    }

    fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            metadata: self.metadata().clone(),
            status: self.status,
            error: self.error.clone(),
            config: self.instance.context.config(),
            registered_at: self.registered_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
        }
    }
}

/// Owns every registered extension and orchestrates register, start, stop
/// and unregister along the dependency graph.
///
/// Mutating operations are serialized by an async operation lock, so a
/// start chain never interleaves with an unregister. Lifecycle hooks run
/// while that lock is held and must not call back into the registry.
pub struct LifecycleRegistry {
    registrations: RwLock<HashMap<ExtensionId, Registration>>,
    next_seq: AtomicU64,
    op_lock: AsyncMutex<()>,
    sandbox: SandboxEnvironment,
    monitor: Arc<StateMonitor>,
    hook_timeout: Duration,
    events: EventBus<LifecycleEvent>,
}

impl LifecycleRegistry {
    /// Build the registry and install it as the monitor's metrics source.
    pub fn new(
        sandbox: SandboxEnvironment,
        monitor: Arc<StateMonitor>,
        hook_timeout: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            registrations: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            op_lock: AsyncMutex::new(()),
            sandbox,
            monitor: Arc::clone(&monitor),
            hook_timeout,
            events: EventBus::new(256),
        });
        monitor.set_source(Arc::new(RegistryMetrics {
            registry: Arc::downgrade(&registry),
        }));
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn monitor(&self) -> &Arc<StateMonitor> {
        &self.monitor
    }

    // ── Registration ───────────────────────────────────────────

    /// Validate and register an extension. `config` is merged over the
    /// extension's default config; `enabled` defaults to true.
    pub async fn register(&self, extension: Extension, config: Map<String, Value>) -> Result<()> {
        extension.metadata.validate()?;

        let _guard = self.op_lock.lock().await;
        let id = extension.id().clone();
        if self.registrations.read().contains_key(&id) {
            return Err(LinchError::AlreadyRegistered(id));
        }

        let loading = Instant::now();
        let mut merged = extension.hooks.default_config();
        merged.extend(config);
        merged
            .entry("enabled")
            .or_insert(Value::Bool(true));

        let executor = self.sandbox.executor_for(&id)?;
        let context = ExtensionContext::new(
            id.clone(),
            extension.metadata.permissions.iter().cloned().collect(),
            merged,
            self.sandbox.store.clone(),
            self.sandbox.hub.clone(),
        );
        let metadata = extension.metadata.clone();
        let instance = Arc::new(ExtensionInstance::new(
            extension,
            context,
            executor,
            self.hook_timeout,
        ));

        self.registrations.write().insert(
            id.clone(),
            Registration {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                instance,
                status: ExtensionStatus::Registered,
                error: None,
                registered_at: Utc::now(),
                started_at: None,
                stopped_at: None,
            },
        );
        self.monitor.track(&id, ExtensionStatus::Registered);
        let load_ms = loading.elapsed().as_millis() as u64;
        self.monitor.update_metrics(&id, |m| m.load_time_ms = load_ms);

        info!(extension = %id, version = %metadata.version, "extension registered");
        self.events
            .publish(LifecycleEvent::Registered { extension: metadata });
        Ok(())
    }

    /// Remove an extension nothing else depends on. Stops it first if it is
    /// running, runs `destroy`, revokes its grants and disposes its sandbox.
    pub async fn unregister(&self, id: &ExtensionId) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let (instance, status) = {
            let registrations = self.registrations.read();
            let reg = registrations
                .get(id)
                .ok_or_else(|| LinchError::NotFound(id.clone()))?;
            (Arc::clone(&reg.instance), reg.status)
        };

        let dependents = self.get_dependents(id);
        if !dependents.is_empty() {
            return Err(LinchError::HasDependents {
                extension: id.clone(),
                dependents,
            });
        }

        if status == ExtensionStatus::Running
            && let Err(e) = self.stop_locked(id, &mut HashSet::new()).await
        {
            warn!(extension = %id, error = %e, "stop failed during unregister");
        }
        if let Err(e) = instance.run_hook(LifecycleHook::Destroy).await {
            warn!(extension = %id, error = %e, "destroy hook failed");
        }
        instance.dispose().await;
        let revoked = self.sandbox.permissions.revoke_all_permissions(id);

        self.registrations.write().remove(id);
        self.monitor.untrack(id);

        info!(extension = %id, revoked, "extension unregistered");
        self.events.publish(LifecycleEvent::Unregistered {
            extension_id: id.clone(),
        });
        Ok(())
    }

    // ── Start / stop ───────────────────────────────────────────

    /// Start an extension after all of its dependencies. Idempotent for a
    /// running extension; on an `error` extension this is the retry.
    pub async fn start(&self, id: &ExtensionId) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.start_locked(id).await
    }

    /// Stop an extension after stopping every running dependent.
    /// A no-op for anything not running.
    pub async fn stop(&self, id: &ExtensionId) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked(id, &mut HashSet::new()).await
    }

    pub async fn restart(&self, id: &ExtensionId) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked(id, &mut HashSet::new()).await?;
        self.start_locked(id).await
    }

    /// Start every enabled extension in registration order. One failure
    /// never prevents the others from being attempted.
    pub async fn start_all(&self) -> Vec<BulkResult> {
        let _guard = self.op_lock.lock().await;
        let mut results = Vec::new();
        for id in self.ordered_ids(true) {
            let result = self.start_locked(&id).await.map_err(|e| e.to_record());
            results.push(BulkResult {
                extension_id: id,
                result,
            });
        }
        results
    }

    /// Stop every extension in reverse registration order.
    pub async fn stop_all(&self) -> Vec<BulkResult> {
        let _guard = self.op_lock.lock().await;
        let mut results = Vec::new();
        for id in self.ordered_ids(false).into_iter().rev() {
            let result = self
                .stop_locked(&id, &mut HashSet::new())
                .await
                .map_err(|e| e.to_record());
            results.push(BulkResult {
                extension_id: id,
                result,
            });
        }
        results
    }

    async fn start_locked(&self, id: &ExtensionId) -> Result<()> {
        let (status, enabled) = {
            let registrations = self.registrations.read();
            let reg = registrations
                .get(id)
                .ok_or_else(|| LinchError::NotFound(id.clone()))?;
            (reg.status, reg.instance.context.is_enabled())
        };
        if status == ExtensionStatus::Running {
            return Ok(());
        }
        if !enabled {
            return Err(LinchError::Disabled(id.clone()));
        }

        // Graph errors surface before any hook runs.
        let plan = self.start_plan(id)?;
        debug!(extension = %id, plan = ?plan, "resolved start order");

        for dependency in plan.iter().filter(|d| *d != id) {
            if self.status(dependency) == Some(ExtensionStatus::Running) {
                continue;
            }
            if let Err(e) = self.start_one(dependency).await {
                warn!(extension = %id, dependency = %dependency, error = %e, "dependency failed to start");
                return Err(LinchError::Start {
                    extension: id.clone(),
                    reason: format!("dependency {} failed: {}", dependency, e),
                });
            }
        }
        self.start_one(id).await
    }

    /// Run `init → setup → start → ready` for one extension whose
    /// dependencies are already running.
    async fn start_one(&self, id: &ExtensionId) -> Result<()> {
        let instance = self
            .instance(id)
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;
        if !instance.context.is_enabled() {
            return Err(LinchError::Disabled(id.clone()));
        }

        let activating = Instant::now();
        for hook in LifecycleHook::STARTUP {
            if let Err(e) = instance.run_hook(hook).await {
                warn!(extension = %id, hook = %hook, error = %e, "lifecycle hook failed");
                let error = LinchError::Start {
                    extension: id.clone(),
                    reason: e.to_string(),
                };
                self.mark_error(id, &error);
                return Err(error);
            }
        }

        let activation_ms = activating.elapsed().as_millis() as u64;
        let metadata = {
            let mut registrations = self.registrations.write();
            let Some(reg) = registrations.get_mut(id) else {
                return Err(LinchError::NotFound(id.clone()));
            };
            reg.status = ExtensionStatus::Running;
            reg.error = None;
            reg.started_at = Some(Utc::now());
            reg.metadata().clone()
        };
        self.monitor.update_status(id, ExtensionStatus::Running);
        self.monitor
            .update_metrics(id, |m| m.activation_time_ms = activation_ms);

        info!(extension = %id, activation_ms, "extension started");
        self.events.publish(LifecycleEvent::Started {
            extension_id: id.clone(),
            extension: metadata,
        });
        Ok(())
    }

    fn stop_locked<'a>(
        &'a self,
        id: &'a ExtensionId,
        stopping: &'a mut HashSet<ExtensionId>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if self.status(id).ok_or_else(|| LinchError::NotFound(id.clone()))?
                != ExtensionStatus::Running
            {
                return Ok(());
            }
            if !stopping.insert(id.clone()) {
                return Ok(());
            }

            for dependent in self.get_dependents(id) {
                if self.status(&dependent) != Some(ExtensionStatus::Running) {
                    continue;
                }
                if let Err(e) = self.stop_locked(&dependent, stopping).await {
                    warn!(extension = %id, dependent = %dependent, error = %e, "dependent failed to stop");
                }
            }
            self.stop_one(id).await
        }
        .boxed()
    }

    async fn stop_one(&self, id: &ExtensionId) -> Result<()> {
        let instance = self
            .instance(id)
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;

        if let Err(e) = instance.run_hook(LifecycleHook::Stop).await {
            warn!(extension = %id, error = %e, "stop hook failed");
            let error = LinchError::Stop {
                extension: id.clone(),
                reason: e.to_string(),
            };
            self.mark_error(id, &error);
            return Err(error);
        }

        let metadata = {
            let mut registrations = self.registrations.write();
            let Some(reg) = registrations.get_mut(id) else {
                return Err(LinchError::NotFound(id.clone()));
            };
            reg.status = ExtensionStatus::Stopped;
            reg.stopped_at = Some(Utc::now());
            reg.metadata().clone()
        };
        self.monitor.update_status(id, ExtensionStatus::Stopped);

        info!(extension = %id, "extension stopped");
        self.events.publish(LifecycleEvent::Stopped {
            extension_id: id.clone(),
            extension: metadata,
        });
        Ok(())
    }

    fn mark_error(&self, id: &ExtensionId, error: &LinchError) {
        let record = error.to_record();
        if let Some(reg) = self.registrations.write().get_mut(id) {
            reg.status = ExtensionStatus::Error;
            reg.error = Some(record.clone());
        }
        self.monitor.update_status(id, ExtensionStatus::Error);
        self.events.publish(LifecycleEvent::Error {
            extension_id: id.clone(),
            error: record,
        });
    }

    // ── Dependency graph ───────────────────────────────────────

    /// Dependencies first, `root` last. Fails on a missing dependency or a
    /// cycle anywhere below `root`.
    fn start_plan(&self, root: &ExtensionId) -> Result<Vec<ExtensionId>> {
        let registrations = self.registrations.read();
        let mut plan = Vec::new();
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        visit(&registrations, root, &mut path, &mut visited, &mut plan)?;
        Ok(plan)
    }

    /// Every registered extension that declares `id` as a dependency, sorted.
    pub fn get_dependents(&self, id: &ExtensionId) -> Vec<ExtensionId> {
        let mut dependents: Vec<ExtensionId> = self
            .registrations
            .read()
            .values()
            .filter(|reg| reg.metadata().dependencies.contains(id))
            .map(|reg| reg.metadata().id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    fn ordered_ids(&self, enabled_only: bool) -> Vec<ExtensionId> {
        let registrations = self.registrations.read();
        let mut entries: Vec<(u64, &ExtensionId)> = registrations
            .iter()
            .filter(|(_, reg)| !enabled_only || reg.instance.context.is_enabled())
            .map(|(id, reg)| (reg.seq, id))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, id)| id.clone()).collect()
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn status(&self, id: &ExtensionId) -> Option<ExtensionStatus> {
        self.registrations.read().get(id).map(|reg| reg.status)
    }

    pub fn get(&self, id: &ExtensionId) -> Option<RegistrationInfo> {
        self.registrations.read().get(id).map(Registration::info)
    }

    /// All registrations in registration order.
    pub fn list(&self) -> Vec<RegistrationInfo> {
        let registrations = self.registrations.read();
        let mut entries: Vec<&Registration> = registrations.values().collect();
        entries.sort_unstable_by_key(|reg| reg.seq);
        entries.into_iter().map(Registration::info).collect()
    }

    pub fn instance(&self, id: &ExtensionId) -> Option<Arc<ExtensionInstance>> {
        self.registrations
            .read()
            .get(id)
            .map(|reg| Arc::clone(&reg.instance))
    }

    pub fn is_registered(&self, id: &ExtensionId) -> bool {
        self.registrations.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Merge `patch` into the extension's config. Takes effect on the next
    /// hook call; `enabled = false` blocks the next start.
    pub fn update_config(&self, id: &ExtensionId, patch: Map<String, Value>) -> Result<()> {
        let instance = self
            .instance(id)
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;
        instance.context.merge_config(patch);
        debug!(extension = %id, "config updated");
        Ok(())
    }

    /// Run sandboxed code on behalf of an extension and count it as a
    /// request in the monitor.
    pub async fn execute(
        &self,
        id: &ExtensionId,
        code: impl AsRef<[u8]>,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let instance = self
            .instance(id)
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;
        let started = Instant::now();
        let result = instance.executor().execute_code(code, function, args).await;
        self.monitor
            .record_request(id, started.elapsed(), result.is_err());
        result
    }
}

fn visit(
    registrations: &HashMap<ExtensionId, Registration>,
    id: &ExtensionId,
    path: &mut Vec<ExtensionId>,
    visited: &mut HashSet<ExtensionId>,
    plan: &mut Vec<ExtensionId>,
) -> Result<()> {
    if visited.contains(id) {
        return Ok(());
    }
    if let Some(pos) = path.iter().position(|p| p == id) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(id.clone());
        return Err(LinchError::CircularDependency { cycle });
    }
    let reg = registrations
        .get(id)
        .ok_or_else(|| LinchError::NotFound(id.clone()))?;

    path.push(id.clone());
    for dependency in &reg.metadata().dependencies {
        if !registrations.contains_key(dependency) {
            return Err(LinchError::DependencyMissing {
                extension: id.clone(),
                dependency: dependency.clone(),
            });
        }
        visit(registrations, dependency, path, visited, plan)?;
    }
    path.pop();

    visited.insert(id.clone());
    plan.push(id.clone());
    Ok(())
}

/// [`MetricsSource`] over the registry's instances.
struct RegistryMetrics {
    registry: Weak<LifecycleRegistry>,
}

#[async_trait]
impl MetricsSource for RegistryMetrics {
    async fn sample(&self, extension: &ExtensionId) -> Option<MetricsSample> {
        let registry = self.registry.upgrade()?;
        let instance = registry.instance(extension)?;
        let stats = instance.executor().stats();
        let finished = stats.completed + stats.failed + stats.timeouts;
        Some(MetricsSample {
            memory_bytes: stats.last_memory_bytes + registry.sandbox.store.footprint(extension),
            cpu_time_ms: (stats.avg_duration_ms * finished as f64).round() as u64,
        })
    }

    async fn health_response(&self, extension: &ExtensionId) -> Option<HealthResponse> {
        let instance = self.registry.upgrade()?.instance(extension)?;
        instance.timed_health_check().await
    }
}
