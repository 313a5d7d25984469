use chrono::{DateTime, Utc};
use linch_core::{ErrorRecord, ExtensionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        self != ExecutionStatus::Running
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub memory_bytes: u64,
}

/// One code execution inside a sandbox. Immutable once finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub id: Uuid,
    pub extension: ExtensionId,
    pub function: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub resources: ResourceUsage,
}

impl SandboxExecution {
    pub(crate) fn start(extension: ExtensionId, function: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            extension,
            function: function.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            resources: ResourceUsage::default(),
        }
    }

    pub(crate) fn finish(
        &mut self,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<ErrorRecord>,
        memory_bytes: u64,
    ) {
        let now = Utc::now();
        self.status = status;
        self.result = result;
        self.error = error;
        self.resources = ResourceUsage {
            duration_ms: (now - self.started_at).num_milliseconds().max(0) as u64,
            memory_bytes,
        };
        self.ended_at = Some(now);
    }
}

/// Events published by a [`SandboxExecutor`](crate::SandboxExecutor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "execution", rename_all = "snake_case")]
pub enum SandboxEvent {
    ExecutionStart(SandboxExecution),
    ExecutionComplete(SandboxExecution),
    ExecutionError(SandboxExecution),
}

impl SandboxEvent {
    pub fn execution(&self) -> &SandboxExecution {
        match self {
            SandboxEvent::ExecutionStart(e)
            | SandboxEvent::ExecutionComplete(e)
            | SandboxEvent::ExecutionError(e) => e,
        }
    }
}

/// Running totals for one executor. Not bounded by the history size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub running: usize,
    pub avg_duration_ms: f64,
    pub last_memory_bytes: u64,
}

impl ExecutorStats {
    pub(crate) fn record(&mut self, execution: &SandboxExecution) {
        let finished = self.completed + self.failed + self.timeouts;
        let duration = execution.resources.duration_ms as f64;
        self.avg_duration_ms =
            (self.avg_duration_ms * finished as f64 + duration) / (finished + 1) as f64;
        match execution.status {
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Timeout => self.timeouts += 1,
            ExecutionStatus::Running => {}
        }
        self.last_memory_bytes = execution.resources.memory_bytes;
    }

    /// Failed plus timed-out executions.
    pub fn errors(&self) -> u64 {
        self.failed + self.timeouts
    }
}
