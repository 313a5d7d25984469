use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExtensionId;

/// Unified error type for the Linch runtime.
#[derive(Error, Debug)]
pub enum LinchError {
    // ── Validation errors ──────────────────────────────────────
    #[error("invalid extension registration: {0}")]
    Registration(String),

    #[error("extension already registered: {0}")]
    AlreadyRegistered(ExtensionId),

    // ── Lookup / graph errors ──────────────────────────────────
    #[error("extension not found: {0}")]
    NotFound(ExtensionId),

    #[error("extension {extension} is required by: {}", join_ids(.dependents))]
    HasDependents {
        extension: ExtensionId,
        dependents: Vec<ExtensionId>,
    },

    #[error("extension is disabled: {0}")]
    Disabled(ExtensionId),

    #[error("extension {extension} depends on {dependency}, which is not registered")]
    DependencyMissing {
        extension: ExtensionId,
        dependency: ExtensionId,
    },

    #[error("circular dependency detected: {}", .cycle.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(" -> "))]
    CircularDependency { cycle: Vec<ExtensionId> },

    // ── Policy errors ──────────────────────────────────────────
    #[error("Extension {extension} does not have permission: {permission}")]
    PermissionDenied {
        extension: ExtensionId,
        permission: String,
    },

    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    // ── Infrastructure errors ──────────────────────────────────
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("failed to import {module}: {reason}")]
    ImportFailed { module: String, reason: String },

    #[error("failed to load extension {extension}: {reason}")]
    Load { extension: String, reason: String },

    #[error("failed to unload extension {extension}: {reason}")]
    UnloadFailed { extension: String, reason: String },

    // ── Execution errors ───────────────────────────────────────
    #[error("failed to start {extension}: {reason}")]
    Start {
        extension: ExtensionId,
        reason: String,
    },

    #[error("failed to stop {extension}: {reason}")]
    Stop {
        extension: ExtensionId,
        reason: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("sandbox global is not available: {0}")]
    GlobalUnavailable(String),

    #[error("execution of '{function}' timed out after {timeout_ms}ms")]
    Timeout { function: String, timeout_ms: u64 },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LinchError>;

fn join_ids(ids: &[ExtensionId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stable, caller-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RegistrationError,
    ExtensionAlreadyRegistered,
    ExtensionNotFound,
    ExtensionHasDependents,
    ExtensionDisabled,
    DependencyMissing,
    CircularDependency,
    PermissionDenied,
    UnknownPermission,
    ManifestNotFound,
    ImportFailed,
    LoadError,
    UnloadFailed,
    StartError,
    StopError,
    SandboxError,
    ExecutionTimeout,
    ConfigError,
    IoError,
    SerializationError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistrationError => "REGISTRATION_ERROR",
            Self::ExtensionAlreadyRegistered => "EXTENSION_ALREADY_REGISTERED",
            Self::ExtensionNotFound => "EXTENSION_NOT_FOUND",
            Self::ExtensionHasDependents => "EXTENSION_HAS_DEPENDENTS",
            Self::ExtensionDisabled => "EXTENSION_DISABLED",
            Self::DependencyMissing => "DEPENDENCY_MISSING",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::UnknownPermission => "UNKNOWN_PERMISSION",
            Self::ManifestNotFound => "MANIFEST_NOT_FOUND",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::LoadError => "LOAD_ERROR",
            Self::UnloadFailed => "UNLOAD_FAILED",
            Self::StartError => "START_ERROR",
            Self::StopError => "STOP_ERROR",
            Self::SandboxError => "SANDBOX_ERROR",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LinchError {
    /// The stable code surfaced to callers for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Registration(_) => ErrorCode::RegistrationError,
            Self::AlreadyRegistered(_) => ErrorCode::ExtensionAlreadyRegistered,
            Self::NotFound(_) => ErrorCode::ExtensionNotFound,
            Self::HasDependents { .. } => ErrorCode::ExtensionHasDependents,
            Self::Disabled(_) => ErrorCode::ExtensionDisabled,
            Self::DependencyMissing { .. } => ErrorCode::DependencyMissing,
            Self::CircularDependency { .. } => ErrorCode::CircularDependency,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::UnknownPermission(_) => ErrorCode::UnknownPermission,
            Self::ManifestNotFound(_) => ErrorCode::ManifestNotFound,
            Self::ImportFailed { .. } => ErrorCode::ImportFailed,
            Self::Load { .. } => ErrorCode::LoadError,
            Self::UnloadFailed { .. } => ErrorCode::UnloadFailed,
            Self::Start { .. } => ErrorCode::StartError,
            Self::Stop { .. } => ErrorCode::StopError,
            Self::Sandbox(_) | Self::GlobalUnavailable(_) => ErrorCode::SandboxError,
            Self::Timeout { .. } => ErrorCode::ExecutionTimeout,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Snapshot this error into a cloneable record.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// A retained, serializable copy of an error (e.g. the cause of an `error` status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
