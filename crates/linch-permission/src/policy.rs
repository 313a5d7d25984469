use async_trait::async_trait;
use linch_core::ExtensionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::engine::PermissionContext;

/// Risk classification of a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Custom check run after a grant and its dependencies have been verified.
///
/// Returning `Ok(false)` or an error denies the permission.
#[async_trait]
pub trait PermissionValidator: Send + Sync {
    async fn validate(
        &self,
        extension: &ExtensionId,
        permission: &str,
        context: &PermissionContext,
    ) -> anyhow::Result<bool>;
}

struct FnValidator<F>(F);

#[async_trait]
impl<F> PermissionValidator for FnValidator<F>
where
    F: Fn(&ExtensionId, &str, &PermissionContext) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    async fn validate(
        &self,
        extension: &ExtensionId,
        permission: &str,
        context: &PermissionContext,
    ) -> anyhow::Result<bool> {
        (self.0)(extension, permission, context)
    }
}

/// Wrap a synchronous closure as a [`PermissionValidator`].
pub fn validator_fn<F>(f: F) -> Arc<dyn PermissionValidator>
where
    F: Fn(&ExtensionId, &str, &PermissionContext) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

/// Static rule describing one named permission.
#[derive(Clone)]
pub struct PermissionPolicy {
    pub name: String,
    pub description: String,
    pub level: RiskLevel,
    pub requires_user_confirmation: bool,
    /// Other permissions that must also hold whenever this one is checked.
    pub dependencies: Vec<String>,
    pub validator: Option<Arc<dyn PermissionValidator>>,
}

impl fmt::Debug for PermissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionPolicy")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("requires_user_confirmation", &self.requires_user_confirmation)
            .field("dependencies", &self.dependencies)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl PermissionPolicy {
    pub fn new(name: impl Into<String>, level: RiskLevel) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            level,
            requires_user_confirmation: false,
            dependencies: Vec::new(),
            validator: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.requires_user_confirmation = true;
        self
    }

    pub fn depends_on(mut self, permission: impl Into<String>) -> Self {
        self.dependencies.push(permission.into());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn PermissionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// The default policy catalogue.
pub fn builtin_policies() -> Vec<PermissionPolicy> {
    vec![
        PermissionPolicy::new("database:read", RiskLevel::Low)
            .description("Read records from extension storage"),
        PermissionPolicy::new("database:write", RiskLevel::Medium)
            .description("Create and update records in extension storage")
            .depends_on("database:read"),
        PermissionPolicy::new("database:delete", RiskLevel::High)
            .description("Delete records from extension storage")
            .depends_on("database:write")
            .requires_confirmation(),
        PermissionPolicy::new("api:read", RiskLevel::Low)
            .description("Issue read-only API and network requests"),
        PermissionPolicy::new("api:write", RiskLevel::Medium)
            .description("Issue mutating API requests")
            .depends_on("api:read"),
        PermissionPolicy::new("ui:render", RiskLevel::Low)
            .description("Contribute components to the host UI"),
        PermissionPolicy::new("system:hooks", RiskLevel::Medium)
            .description("Emit and subscribe to host events"),
        PermissionPolicy::new("system:config", RiskLevel::High)
            .description("Read and modify host configuration")
            .requires_confirmation(),
        PermissionPolicy::new("filesystem:read", RiskLevel::High)
            .description("Read files from the host filesystem")
            .requires_confirmation(),
        PermissionPolicy::new("network:external", RiskLevel::High)
            .description("Reach arbitrary external hosts")
            .depends_on("api:read")
            .requires_confirmation(),
        PermissionPolicy::new("system:admin", RiskLevel::Critical)
            .description("Full administrative access to the host")
            .requires_confirmation(),
    ]
}
