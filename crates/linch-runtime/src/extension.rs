use async_trait::async_trait;
use linch_core::{ExtensionId, LinchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::context::ExtensionContext;

/// What an extension contributes to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    #[serde(rename = "hasUI")]
    pub has_ui: bool,
    #[serde(rename = "hasAPI")]
    pub has_api: bool,
    pub has_schema: bool,
    pub has_hooks: bool,
}

/// Module paths per capability, relative to the extension directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entries {
    pub schema: Option<String>,
    pub api: Option<String>,
    pub components: Option<String>,
    pub hooks: Option<String>,
}

/// Immutable descriptor of an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    pub id: ExtensionId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<ExtensionId>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub entries: Entries,
}

impl ExtensionMetadata {
    /// Minimal metadata; `name` defaults to the id.
    pub fn new(id: impl Into<ExtensionId>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            version: version.into(),
            description: None,
            display_name: None,
            category: None,
            tags: Vec::new(),
            permissions: BTreeSet::new(),
            dependencies: Vec::new(),
            capabilities: Capabilities::default(),
            entries: Entries::default(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<ExtensionId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Reject metadata before any side effect happens.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(LinchError::Registration("extension id is empty".into()));
        }
        // ':' separates the id from event names on the shared hub.
        if self.id.as_str().contains(':') {
            return Err(LinchError::Registration(format!(
                "extension id '{}' must not contain ':'",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(LinchError::Registration(format!(
                "extension {} has an empty name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(LinchError::Registration(format!(
                "extension {} has an empty version",
                self.id
            )));
        }
        if let Err(e) = semver::Version::parse(&self.version) {
            debug!(extension = %self.id, version = %self.version, error = %e, "version is not semver");
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.is_empty() {
                return Err(LinchError::Registration(format!(
                    "extension {} declares an empty dependency id",
                    self.id
                )));
            }
            if dep == &self.id {
                return Err(LinchError::Registration(format!(
                    "extension {} depends on itself",
                    self.id
                )));
            }
            if !seen.insert(dep) {
                return Err(LinchError::Registration(format!(
                    "extension {} declares dependency {} twice",
                    self.id, dep
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle hooks implemented by an extension. Every hook defaults to a no-op.
#[async_trait]
pub trait ExtensionHooks: Send + Sync {
    async fn init(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn setup(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ready(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Liveness check used by the monitor for response time and health.
    async fn health_check(&self, _ctx: &ExtensionContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Configuration the registry merges caller config over.
    fn default_config(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Hooks for extensions that ship no hooks entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ExtensionHooks for NoopHooks {}

/// An extension: its metadata plus its hooks.
#[derive(Clone)]
pub struct Extension {
    pub metadata: ExtensionMetadata,
    pub hooks: Arc<dyn ExtensionHooks>,
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("id", &self.metadata.id)
            .field("version", &self.metadata.version)
            .finish()
    }
}

impl Extension {
    pub fn new(metadata: ExtensionMetadata, hooks: Arc<dyn ExtensionHooks>) -> Self {
        Self { metadata, hooks }
    }

    pub fn without_hooks(metadata: ExtensionMetadata) -> Self {
        Self::new(metadata, Arc::new(NoopHooks))
    }

    pub fn id(&self) -> &ExtensionId {
        &self.metadata.id
    }
}

/// The six lifecycle hooks, in the order a full start/stop cycle runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleHook {
    Init,
    Setup,
    Start,
    Ready,
    Stop,
    Destroy,
}

impl LifecycleHook {
    pub const STARTUP: [LifecycleHook; 4] = [
        LifecycleHook::Init,
        LifecycleHook::Setup,
        LifecycleHook::Start,
        LifecycleHook::Ready,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleHook::Init => "init",
            LifecycleHook::Setup => "setup",
            LifecycleHook::Start => "start",
            LifecycleHook::Ready => "ready",
            LifecycleHook::Stop => "stop",
            LifecycleHook::Destroy => "destroy",
        }
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-visible lifecycle state. "Unregistered" is the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionStatus {
    Registered,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionStatus::Registered => "registered",
            ExtensionStatus::Running => "running",
            ExtensionStatus::Stopped => "stopped",
            ExtensionStatus::Error => "error",
        };
        f.write_str(s)
    }
}
