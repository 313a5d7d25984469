use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use linch_config::MonitorConfig;
use linch_core::{EventBus, ExtensionId, LinchError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extension::ExtensionStatus;

/// Counters and gauges for one extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMetrics {
    pub load_time_ms: u64,
    pub activation_time_ms: u64,
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub response_time_ms: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ExtensionMetrics {
    /// `error_count / request_count`, zero before the first request.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl HealthCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionHealth {
    pub score: u8,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for ExtensionHealth {
    fn default() -> Self {
        Self {
            score: 100,
            status: HealthStatus::Unknown,
            checks: Vec::new(),
            last_checked: None,
        }
    }
}

/// Health and metrics snapshot for one registered extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionState {
    pub id: ExtensionId,
    pub status: ExtensionStatus,
    pub metrics: ExtensionMetrics,
    pub health: ExtensionHealth,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Tracked {
        extension_id: ExtensionId,
    },
    Untracked {
        extension_id: ExtensionId,
    },
    StatusChanged {
        extension_id: ExtensionId,
        status: ExtensionStatus,
    },
    HealthChecked {
        extension_id: ExtensionId,
        health: ExtensionHealth,
    },
}

/// Resource sample for one extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSample {
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
}

/// Answer of an extension's `health_check` hook and how long it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthResponse {
    pub healthy: bool,
    pub elapsed: Duration,
}

/// Source of live measurements. Implemented over the lifecycle registry.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, extension: &ExtensionId) -> Option<MetricsSample>;

    /// Run the extension's `health_check` hook. `None` if it errored or
    /// timed out.
    async fn health_response(&self, extension: &ExtensionId) -> Option<HealthResponse>;
}

/// Keeps one [`ExtensionState`] per registered extension, scores health and
/// drives the periodic health and metrics sweeps.
pub struct StateMonitor {
    config: MonitorConfig,
    states: RwLock<HashMap<ExtensionId, ExtensionState>>,
    source: RwLock<Option<Arc<dyn MetricsSource>>>,
    events: EventBus<MonitorEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StateMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            source: RwLock::new(None),
            events: EventBus::new(256),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_source(&self, source: Arc<dyn MetricsSource>) {
        *self.source.write() = Some(source);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    // ── State map ──────────────────────────────────────────────

    /// Create a fresh state. Replaces any stale one for the same id.
    pub fn track(&self, id: &ExtensionId, status: ExtensionStatus) {
        let state = ExtensionState {
            id: id.clone(),
            status,
            metrics: ExtensionMetrics::default(),
            health: ExtensionHealth::default(),
            updated_at: Utc::now(),
        };
        self.states.write().insert(id.clone(), state);
        self.events.publish(MonitorEvent::Tracked {
            extension_id: id.clone(),
        });
    }

    pub fn untrack(&self, id: &ExtensionId) -> bool {
        let removed = self.states.write().remove(id).is_some();
        if removed {
            self.events.publish(MonitorEvent::Untracked {
                extension_id: id.clone(),
            });
        }
        removed
    }

    pub fn update_status(&self, id: &ExtensionId, status: ExtensionStatus) {
        let changed = match self.states.write().get_mut(id) {
            Some(state) => {
                let changed = state.status != status;
                state.status = status;
                state.updated_at = Utc::now();
                changed
            }
            None => return,
        };
        if changed {
            self.events.publish(MonitorEvent::StatusChanged {
                extension_id: id.clone(),
                status,
            });
        }
    }

    pub fn update_metrics(&self, id: &ExtensionId, update: impl FnOnce(&mut ExtensionMetrics)) {
        if let Some(state) = self.states.write().get_mut(id) {
            update(&mut state.metrics);
            state.updated_at = Utc::now();
        }
    }

    pub fn update_health(&self, id: &ExtensionId, update: impl FnOnce(&mut ExtensionHealth)) {
        if let Some(state) = self.states.write().get_mut(id) {
            update(&mut state.health);
            state.updated_at = Utc::now();
        }
    }

    /// Count one request against the extension.
    pub fn record_request(&self, id: &ExtensionId, duration: Duration, failed: bool) {
        self.update_metrics(id, |m| {
            m.request_count += 1;
            if failed {
                m.error_count += 1;
            }
            m.response_time_ms = duration.as_millis() as u64;
            m.last_activity = Some(Utc::now());
        });
    }

    pub fn get_state(&self, id: &ExtensionId) -> Option<ExtensionState> {
        self.states.read().get(id).cloned()
    }

    /// Every tracked state, ordered by id.
    pub fn all_states(&self) -> Vec<ExtensionState> {
        let mut states: Vec<_> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub fn is_tracked(&self, id: &ExtensionId) -> bool {
        self.states.read().contains_key(id)
    }

    // ── Health ─────────────────────────────────────────────────

    /// Run the four health checks and store the result.
    pub async fn perform_health_check(&self, id: &ExtensionId) -> Result<ExtensionHealth> {
        if !self.is_tracked(id) {
            return Err(LinchError::NotFound(id.clone()));
        }

        let source = self.source.read().clone();
        let mut reported_healthy = None;
        if let Some(source) = source
            && let Some(response) = source.health_response(id).await
        {
            self.update_metrics(id, |m| {
                m.response_time_ms = response.elapsed.as_millis() as u64
            });
            reported_healthy = Some(response.healthy);
        }

        let state = self
            .get_state(id)
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;
        let checks = vec![
            self.check_status(state.status),
            self.check_memory(&state.metrics),
            self.check_response_time(&state.metrics, reported_healthy),
            self.check_error_rate(&state.metrics),
        ];
        let health = score_checks(checks);

        self.update_health(id, |h| *h = health.clone());
        debug!(
            extension = %id,
            score = health.score,
            status = ?health.status,
            "health check complete"
        );
        self.events.publish(MonitorEvent::HealthChecked {
            extension_id: id.clone(),
            health: health.clone(),
        });
        Ok(health)
    }

    fn check_status(&self, status: ExtensionStatus) -> HealthCheck {
        match status {
            ExtensionStatus::Running => HealthCheck::new("status", CheckStatus::Pass, "running"),
            ExtensionStatus::Error => {
                HealthCheck::new("status", CheckStatus::Fail, "extension is in error state")
            }
            other => HealthCheck::new(
                "status",
                CheckStatus::Warn,
                format!("extension is {}", other),
            ),
        }
    }

    fn check_memory(&self, metrics: &ExtensionMetrics) -> HealthCheck {
        let ceiling = self.config.memory_ceiling_mb * 1024 * 1024;
        if ceiling == 0 {
            return HealthCheck::new("memory", CheckStatus::Pass, "no memory ceiling");
        }
        let ratio = metrics.memory_bytes as f64 / ceiling as f64;
        let message = format!("{:.0}% of {} MB", ratio * 100.0, self.config.memory_ceiling_mb);
        let status = if ratio > 1.0 {
            CheckStatus::Fail
        } else if ratio >= 0.8 {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        HealthCheck::new("memory", status, message)
    }

    /// `reported_healthy` is the hook's own answer; `Some(false)` fails the
    /// check whatever the latency.
    fn check_response_time(
        &self,
        metrics: &ExtensionMetrics,
        reported_healthy: Option<bool>,
    ) -> HealthCheck {
        let ms = metrics.response_time_ms;
        if reported_healthy == Some(false) {
            return HealthCheck::new(
                "response_time",
                CheckStatus::Fail,
                format!("extension reported itself unhealthy ({}ms)", ms),
            );
        }
        let status = if ms > self.config.response_fail_ms {
            CheckStatus::Fail
        } else if ms > self.config.response_warn_ms {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        HealthCheck::new("response_time", status, format!("{}ms", ms))
    }

    fn check_error_rate(&self, metrics: &ExtensionMetrics) -> HealthCheck {
        let rate = metrics.error_rate();
        let status = if rate > self.config.error_rate_fail {
            CheckStatus::Fail
        } else if rate > self.config.error_rate_warn {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        HealthCheck::new(
            "error_rate",
            status,
            format!(
                "{} errors in {} requests",
                metrics.error_count, metrics.request_count
            ),
        )
    }

    // ── Background loops ───────────────────────────────────────

    /// Spawn the health and metrics sweeps. Calling it again while they run
    /// is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        if self.config.enable_health_checks {
            let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));
            tasks.push(spawn_sweep(
                Arc::downgrade(self),
                self.cancel.clone(),
                period,
                |monitor| async move { monitor.health_sweep().await }.boxed(),
            ));
        }
        if self.config.enable_metrics {
            let period = Duration::from_secs(self.config.metrics_interval_secs.max(1));
            tasks.push(spawn_sweep(
                Arc::downgrade(self),
                self.cancel.clone(),
                period,
                |monitor| async move { monitor.metrics_sweep().await }.boxed(),
            ));
        }
        info!(
            health_checks = self.config.enable_health_checks,
            metrics = self.config.enable_metrics,
            "state monitor started"
        );
    }

    /// Cancel both sweeps and wait until they have exited.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }
        debug!("state monitor stopped");
    }

    async fn health_sweep(&self) {
        let running: Vec<ExtensionId> = self
            .states
            .read()
            .values()
            .filter(|s| s.status == ExtensionStatus::Running)
            .map(|s| s.id.clone())
            .collect();
        for id in running {
            if let Err(e) = self.perform_health_check(&id).await {
                debug!(extension = %id, error = %e, "health check skipped");
            }
        }
    }

    async fn metrics_sweep(&self) {
        let Some(source) = self.source.read().clone() else {
            return;
        };
        let ids: Vec<ExtensionId> = self.states.read().keys().cloned().collect();
        for id in ids {
            if let Some(sample) = source.sample(&id).await {
                self.update_metrics(&id, |m| {
                    m.memory_bytes = sample.memory_bytes;
                    m.cpu_time_ms = sample.cpu_time_ms;
                });
            }
        }
    }
}

fn spawn_sweep<F>(
    monitor: Weak<StateMonitor>,
    cancel: CancellationToken,
    period: Duration,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<StateMonitor>) -> BoxFuture<'static, ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    sweep(monitor).await;
                }
            }
        }
    })
}

/// Score = round((pass×100 + warn×50) / checks); below 50 is critical,
/// below 80 or any failed check is a warning.
fn score_checks(checks: Vec<HealthCheck>) -> ExtensionHealth {
    let total = checks.len().max(1) as f64;
    let passed = checks.iter().filter(|c| c.status == CheckStatus::Pass).count() as f64;
    let warned = checks.iter().filter(|c| c.status == CheckStatus::Warn).count() as f64;
    let any_failed = checks.iter().any(|c| c.status == CheckStatus::Fail);

    let score = ((passed * 100.0 + warned * 50.0) / total).round() as u8;
    let status = if score < 50 {
        HealthStatus::Critical
    } else if score < 80 || any_failed {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };

    ExtensionHealth {
        score,
        status,
        checks,
        last_checked: Some(Utc::now()),
    }
}
