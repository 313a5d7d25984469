use linch_core::{ExtensionId, LinchError, Result};
use linch_permission::{PermissionContext, PermissionEngine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::shared::{EventHub, SharedStore};

/// Names of the globals the sandbox can expose.
pub const CONSOLE: &str = "console";
pub const STORAGE: &str = "storage";
pub const EVENTS: &str = "events";
pub const FETCH: &str = "fetch";
pub const FS: &str = "fs";
pub const PROCESS: &str = "process";

pub const ALL_GLOBALS: [&str; 6] = [CONSOLE, STORAGE, EVENTS, FETCH, FS, PROCESS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

/// The API surface visible from inside the sandbox for one extension.
///
/// Every privileged call goes through the permission engine first. A global
/// that is blocked (or not enabled) behaves as if it did not exist.
#[derive(Clone)]
pub struct SandboxGlobals {
    extension: ExtensionId,
    permissions: Arc<PermissionEngine>,
    store: SharedStore,
    hub: EventHub,
    available: Arc<HashSet<String>>,
    http: reqwest::Client,
}

impl SandboxGlobals {
    /// Restricted globals: everything in `blocked` is removed, `fetch` and
    /// `fs` are only present when explicitly allowed.
    pub fn restricted(
        extension: ExtensionId,
        permissions: Arc<PermissionEngine>,
        store: SharedStore,
        hub: EventHub,
        blocked: &[String],
        allow_network: bool,
        allow_file_system: bool,
    ) -> Self {
        let available = ALL_GLOBALS
            .iter()
            .filter(|name| !blocked.iter().any(|b| b == *name))
            .filter(|name| **name != FETCH || allow_network)
            .filter(|name| **name != FS || allow_file_system)
            .map(|name| name.to_string())
            .collect();
        Self::with_available(extension, permissions, store, hub, available)
    }

    /// Every global present. Used when the sandbox is disabled.
    pub fn unrestricted(
        extension: ExtensionId,
        permissions: Arc<PermissionEngine>,
        store: SharedStore,
        hub: EventHub,
    ) -> Self {
        let available = ALL_GLOBALS.iter().map(|s| s.to_string()).collect();
        Self::with_available(extension, permissions, store, hub, available)
    }

    fn with_available(
        extension: ExtensionId,
        permissions: Arc<PermissionEngine>,
        store: SharedStore,
        hub: EventHub,
        available: HashSet<String>,
    ) -> Self {
        Self {
            extension,
            permissions,
            store,
            hub,
            available: Arc::new(available),
            http: reqwest::Client::new(),
        }
    }

    pub fn extension(&self) -> &ExtensionId {
        &self.extension
    }

    pub fn is_available(&self, global: &str) -> bool {
        self.available.contains(global)
    }

    /// Sorted names of the globals that are reachable.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<_> = self.available.iter().cloned().collect();
        names.sort();
        names
    }

    fn require_global(&self, global: &str) -> Result<()> {
        if self.is_available(global) {
            Ok(())
        } else {
            Err(LinchError::GlobalUnavailable(global.to_string()))
        }
    }

    async fn require(&self, permission: &str, context: PermissionContext) -> Result<()> {
        self.permissions
            .require_permission(&self.extension, permission, &context)
            .await
    }

    // ── console ────────────────────────────────────────────────

    pub fn log(&self, level: ConsoleLevel, message: &str) -> Result<()> {
        self.require_global(CONSOLE)?;
        let ext = self.extension.as_str();
        match level {
            ConsoleLevel::Debug => debug!(extension = ext, "{}", message),
            ConsoleLevel::Info => info!(extension = ext, "{}", message),
            ConsoleLevel::Warn => warn!(extension = ext, "{}", message),
            ConsoleLevel::Error => error!(extension = ext, "{}", message),
        }
        Ok(())
    }

    // ── storage ────────────────────────────────────────────────

    pub async fn storage_get(&self, key: &str) -> Result<Option<Value>> {
        self.require_global(STORAGE)?;
        self.require("database:read", key_context(key, "read")).await?;
        Ok(self.store.get(&self.extension, key))
    }

    pub async fn storage_set(&self, key: &str, value: Value) -> Result<()> {
        self.require_global(STORAGE)?;
        self.require("database:write", key_context(key, "write"))
            .await?;
        self.store.set(&self.extension, key, value);
        Ok(())
    }

    pub async fn storage_delete(&self, key: &str) -> Result<bool> {
        self.require_global(STORAGE)?;
        self.require("database:delete", key_context(key, "delete"))
            .await?;
        Ok(self.store.delete(&self.extension, key))
    }

    // ── events ─────────────────────────────────────────────────

    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.require_global(EVENTS)?;
        self.require(
            "system:hooks",
            PermissionContext::default().with("event", event),
        )
        .await?;
        self.hub.emit(&self.extension, event, payload);
        Ok(())
    }

    // ── fetch ──────────────────────────────────────────────────

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.require_global(FETCH)?;
        self.require(
            "api:read",
            PermissionContext::default().with("url", request.url.as_str()),
        )
        .await?;

        let method = request.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| LinchError::Sandbox(format!("invalid method: {}", e)))?;

        debug!(extension = %self.extension, url = %request.url, %method, "sandbox fetch");
        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LinchError::Sandbox(format!("fetch failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| LinchError::Sandbox(format!("fetch body: {}", e)))?;
        Ok(FetchResponse { status, body })
    }

    // ── fs ─────────────────────────────────────────────────────

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        self.require_global(FS)?;
        self.require(
            "filesystem:read",
            PermissionContext::default().with("path", path.display().to_string()),
        )
        .await?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    // ── process ────────────────────────────────────────────────

    pub fn env(&self, name: &str) -> Result<Option<String>> {
        self.require_global(PROCESS)?;
        Ok(std::env::var(name).ok())
    }
}

fn key_context(key: &str, action: &str) -> PermissionContext {
    PermissionContext::default()
        .with("resource", key)
        .with("action", action)
}
