//! # linch-permission
//!
//! The permission engine answers "may extension X do Y now?". Policies
//! describe each named permission (risk level, confirmation requirement,
//! dependencies on other permissions, optional custom validator); grants
//! record which extension currently holds which permission, bounded by
//! expiry and usage quotas.

pub mod confirmation;
pub mod engine;
pub mod grant;
pub mod policy;

pub use confirmation::{
    ConfirmationGate, ConfirmationReceiver, ConfirmationRequest, ConfirmationResponse,
};
pub use engine::{
    CheckKind, PermissionCheck, PermissionContext, PermissionEngine, PermissionEvent,
    PermissionPartition,
};
pub use grant::{GrantOptions, PermissionGrant};
pub use policy::{PermissionPolicy, PermissionValidator, RiskLevel, builtin_policies, validator_fn};
