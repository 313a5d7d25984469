use async_trait::async_trait;
use linch_config::LinchConfig;
use linch_core::{ErrorRecord, EventBus, ExtensionId, LinchError, Result};
use linch_permission::{ConfirmationGate, GrantOptions, PermissionEngine};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Map;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::extension::{Extension, ExtensionHooks, ExtensionMetadata, NoopHooks};
use crate::loader::{ImportOutcome, ModuleLoader};
use crate::manifest::{ExtensionManifest, MANIFEST_FILE};
use crate::registry::LifecycleRegistry;
use crate::reload::Reloader;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    ExtensionLoaded {
        name: String,
        version: String,
        path: PathBuf,
    },
    ExtensionUnloaded {
        name: String,
    },
    ExtensionError {
        name: String,
        error: ErrorRecord,
    },
}

/// Outcome of loading one directory in [`ExtensionManager::load_all`].
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub path: PathBuf,
    pub result: std::result::Result<ExtensionId, ErrorRecord>,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub extensions_dir: PathBuf,
    pub auto_start: bool,
    pub auto_grant: bool,
}

impl ManagerSettings {
    pub fn from_config(config: &LinchConfig) -> Self {
        Self {
            extensions_dir: config.extensions.dir.clone(),
            auto_start: config.extensions.auto_start,
            auto_grant: config.permissions.auto_grant,
        }
    }
}

/// Turns extension directories into running extensions: manifest, hooks
/// import, permission grants, registration and start.
pub struct ExtensionManager {
    registry: Arc<LifecycleRegistry>,
    permissions: Arc<PermissionEngine>,
    confirmation: Arc<ConfirmationGate>,
    loader: Arc<dyn ModuleLoader>,
    settings: ManagerSettings,
    manifests: RwLock<HashMap<PathBuf, ExtensionManifest>>,
    loaded: RwLock<HashMap<ExtensionId, PathBuf>>,
    /// Directories whose last reload failed, kept so the next reload can
    /// retry them.
    failed_reloads: RwLock<HashMap<ExtensionId, PathBuf>>,
    events: EventBus<ManagerEvent>,
}

impl ExtensionManager {
    pub fn new(
        registry: Arc<LifecycleRegistry>,
        permissions: Arc<PermissionEngine>,
        confirmation: Arc<ConfirmationGate>,
        loader: Arc<dyn ModuleLoader>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            permissions,
            confirmation,
            loader,
            settings,
            manifests: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            failed_reloads: RwLock::new(HashMap::new()),
            events: EventBus::new(256),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    pub fn loaded_path(&self, id: &ExtensionId) -> Option<PathBuf> {
        self.loaded.read().get(id).cloned()
    }

    /// Loaded extensions and their directories, ordered by id.
    pub fn loaded(&self) -> Vec<(ExtensionId, PathBuf)> {
        let mut loaded: Vec<_> = self
            .loaded
            .read()
            .iter()
            .map(|(id, path)| (id.clone(), path.clone()))
            .collect();
        loaded.sort();
        loaded
    }

    // ── Discovery ──────────────────────────────────────────────

    /// Sub-directories of the extensions directory that contain a manifest.
    /// A missing extensions directory yields nothing.
    pub async fn discover(&self) -> Result<Vec<PathBuf>> {
        let root = &self.settings.extensions_dir;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %root.display(), "extensions directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(LinchError::Load {
                    extension: root.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir()
                && tokio::fs::try_exists(path.join(MANIFEST_FILE)).await?
            {
                dirs.push(path);
            }
        }
        dirs.sort();
        debug!(count = dirs.len(), "discovered extension directories");
        Ok(dirs)
    }

    /// Parse (or return the cached) manifest of `dir`.
    pub async fn read_manifest(&self, dir: &Path) -> Result<ExtensionManifest> {
        if let Some(manifest) = self.manifests.read().get(dir) {
            return Ok(manifest.clone());
        }
        let manifest = ExtensionManifest::load(dir).await?;
        self.manifests
            .write()
            .insert(dir.to_path_buf(), manifest.clone());
        Ok(manifest)
    }

    // ── Load / unload ──────────────────────────────────────────

    /// Load the extension in `dir`. With `auto_start`, a start failure
    /// leaves the extension registered (in `error`) and is returned.
    pub async fn load_extension(&self, dir: &Path) -> Result<ExtensionId> {
        let result = self.load_inner(dir).await;
        if let Err(e) = &result {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string());
            warn!(extension = %name, error = %e, "failed to load extension");
            self.events.publish(ManagerEvent::ExtensionError {
                name,
                error: e.to_record(),
            });
        }
        result
    }

    async fn load_inner(&self, dir: &Path) -> Result<ExtensionId> {
        let manifest = self.read_manifest(dir).await?;
        let metadata = manifest.to_metadata();
        metadata.validate()?;
        let id = metadata.id.clone();
        if self.registry.is_registered(&id) {
            return Err(LinchError::AlreadyRegistered(id));
        }

        let hooks = self.import_hooks(dir, &manifest).await?;
        self.grant_declared(&metadata).await?;

        let version = metadata.version.clone();
        if let Err(e) = self
            .registry
            .register(Extension::new(metadata, hooks), Map::new())
            .await
        {
            self.permissions.revoke_all_permissions(&id);
            return Err(e);
        }
        self.loaded.write().insert(id.clone(), dir.to_path_buf());

        info!(extension = %id, version = %version, path = %dir.display(), "extension loaded");
        self.events.publish(ManagerEvent::ExtensionLoaded {
            name: id.to_string(),
            version,
            path: dir.to_path_buf(),
        });

        if self.settings.auto_start {
            self.registry.start(&id).await?;
        }
        Ok(id)
    }

    async fn import_hooks(
        &self,
        dir: &Path,
        manifest: &ExtensionManifest,
    ) -> Result<Arc<dyn ExtensionHooks>> {
        let Some(entry) = manifest.hooks_entry() else {
            return Ok(Arc::new(NoopHooks));
        };
        let path = dir.join(entry);
        let import_error = |reason: String| LinchError::ImportFailed {
            module: path.display().to_string(),
            reason,
        };

        if manifest.linchkit.checksum.is_some() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| import_error(e.to_string()))?;
            if !manifest.verify_checksum(&bytes) {
                return Err(import_error("checksum mismatch".into()));
            }
        }

        match self.loader.import_module(&path).await {
            ImportOutcome::Loaded(hooks) => Ok(hooks),
            ImportOutcome::Failed(reason) => Err(import_error(reason)),
        }
    }

    /// Grant every declared permission, asking for confirmation where the
    /// policy requires it. Any denial revokes everything granted so far.
    async fn grant_declared(&self, metadata: &ExtensionMetadata) -> Result<()> {
        let id = &metadata.id;
        let mut options = GrantOptions::default().granted_by("extension-manager");
        if self.settings.auto_grant {
            options = options.auto_grant();
        }
        let partition =
            self.permissions
                .grant_extension_permissions(id, &metadata.permissions, options);

        if let Some(denied) = partition.denied.first() {
            return Err(self.deny(id, denied));
        }

        for permission in &partition.requires_confirmation {
            let Some(policy) = self.permissions.get_policy(permission) else {
                return Err(self.deny(id, permission));
            };
            let response = self
                .confirmation
                .request_confirmation(id, permission, &policy.description, policy.level)
                .await;
            if !response.is_approved() {
                return Err(self.deny(id, permission));
            }
            if let Err(e) = self.permissions.grant_permission(
                id,
                permission,
                GrantOptions::default().granted_by("user"),
            ) {
                self.permissions.revoke_all_permissions(id);
                return Err(e);
            }
        }

        debug!(
            extension = %id,
            granted = partition.granted.len(),
            confirmed = partition.requires_confirmation.len(),
            "permissions granted"
        );
        Ok(())
    }

    fn deny(&self, id: &ExtensionId, permission: &str) -> LinchError {
        self.permissions.revoke_all_permissions(id);
        warn!(extension = %id, permission, "required permission denied");
        LinchError::PermissionDenied {
            extension: id.clone(),
            permission: permission.to_string(),
        }
    }

    /// Unregister an extension and forget its cached manifest. Any failure
    /// surfaces as `UNLOAD_FAILED`.
    pub async fn unload_extension(&self, id: &ExtensionId) -> Result<()> {
        if !self.registry.is_registered(id) && self.failed_reloads.write().remove(id).is_some() {
            info!(extension = %id, "forgot extension whose reload failed");
            return Ok(());
        }
        self.registry
            .unregister(id)
            .await
            .map_err(|e| LinchError::UnloadFailed {
                extension: id.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(dir) = self.loaded.write().remove(id) {
            self.manifests.write().remove(&dir);
        }
        info!(extension = %id, "extension unloaded");
        self.events.publish(ManagerEvent::ExtensionUnloaded {
            name: id.to_string(),
        });
        Ok(())
    }

    /// Unload then load again from the same directory. An unload failure is
    /// returned without attempting the load. When the load fails the
    /// directory is remembered, so a later reload (the next file change)
    /// tries again.
    pub async fn reload_extension(&self, id: &ExtensionId) -> Result<ExtensionId> {
        let dir = self
            .loaded_path(id)
            .or_else(|| self.failed_reloads.read().get(id).cloned())
            .ok_or_else(|| LinchError::NotFound(id.clone()))?;
        if self.registry.is_registered(id) {
            self.unload_extension(id).await?;
        }

        match self.load_extension(&dir).await {
            Ok(loaded) => {
                self.failed_reloads.write().remove(id);
                Ok(loaded)
            }
            Err(e) => {
                // A half-edited package may have parsed; don't serve it next time.
                self.manifests.write().remove(&dir);
                self.failed_reloads.write().insert(id.clone(), dir);
                Err(e)
            }
        }
    }

    /// Extensions whose last reload failed and that will be retried.
    pub fn failed_reloads(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.failed_reloads.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load every discovered extension, dependencies first.
    pub async fn load_all(&self) -> Result<Vec<LoadReport>> {
        let mut reports = Vec::new();
        let mut manifests = Vec::new();
        for dir in self.discover().await? {
            match self.read_manifest(&dir).await {
                Ok(manifest) => manifests.push((dir, manifest)),
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "skipping extension with bad manifest");
                    reports.push(LoadReport {
                        path: dir,
                        result: Err(e.to_record()),
                    });
                }
            }
        }

        for index in load_order(&manifests) {
            let dir = &manifests[index].0;
            let result = self.load_extension(dir).await.map_err(|e| e.to_record());
            reports.push(LoadReport {
                path: dir.clone(),
                result,
            });
        }
        Ok(reports)
    }
}

#[async_trait]
impl Reloader for ExtensionManager {
    async fn reload(&self, extension: &ExtensionId) -> Result<()> {
        self.reload_extension(extension).await.map(|_| ())
    }
}

/// Indices of `manifests` with declared dependencies first. Dependencies
/// outside the set are ignored; a cycle is broken arbitrarily and left for
/// `start` to report.
fn load_order(manifests: &[(PathBuf, ExtensionManifest)]) -> Vec<usize> {
    let index: HashMap<&str, usize> = manifests
        .iter()
        .enumerate()
        .map(|(i, (_, m))| (m.name.as_str(), i))
        .collect();

    fn visit(
        i: usize,
        manifests: &[(PathBuf, ExtensionManifest)],
        index: &HashMap<&str, usize>,
        seen: &mut [bool],
        order: &mut Vec<usize>,
    ) {
        if seen[i] {
            return;
        }
        seen[i] = true;
        for dep in &manifests[i].1.linchkit.dependencies {
            if let Some(&j) = index.get(dep.as_str()) {
                visit(j, manifests, index, seen, order);
            }
        }
        order.push(i);
    }

    let mut seen = vec![false; manifests.len()];
    let mut order = Vec::with_capacity(manifests.len());
    for i in 0..manifests.len() {
        visit(i, manifests, &index, &mut seen, &mut order);
    }
    order
}
