use chrono::Utc;
use futures::future::BoxFuture;
use linch_core::{EventBus, ExtensionId, LinchError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::grant::{GrantOptions, PermissionGrant};
use crate::policy::{PermissionPolicy, builtin_policies};

/// Caller-supplied context for a permission check (resource, action, ...).
///
/// Part of the cache key, so two checks with different contexts are cached
/// separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionContext {
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl PermissionContext {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    fn cache_key(&self) -> String {
        serde_json::Value::Object(self.values.clone()).to_string()
    }
}

/// Outcome of a single permission check, as published for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Granted,
    Denied,
    Expired,
    UsageExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub kind: CheckKind,
    pub extension: ExtensionId,
    pub permission: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Events published by the [`PermissionEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermissionEvent {
    Check(PermissionCheck),
    Assigned {
        extension: ExtensionId,
        permission: String,
        granted_by: String,
    },
    Revoked {
        extension: ExtensionId,
        permission: String,
    },
}

/// Three-way split returned by a bulk grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPartition {
    pub granted: Vec<String>,
    pub denied: Vec<String>,
    pub requires_confirmation: Vec<String>,
}

impl PermissionPartition {
    pub fn is_fully_granted(&self) -> bool {
        self.denied.is_empty() && self.requires_confirmation.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    extension: ExtensionId,
    permission: String,
    context: String,
}

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    valid_until: Instant,
}

/// Owns policies, grants, and the decision cache.
///
/// Grants are mutated only through this type. The usage counter is re-read
/// and incremented under a single lock acquisition, so concurrent checks can
/// never push a grant past its quota.
pub struct PermissionEngine {
    policies: RwLock<HashMap<String, PermissionPolicy>>,
    grants: Mutex<HashMap<ExtensionId, HashMap<String, PermissionGrant>>>,
    cache: Mutex<HashMap<CacheKey, CachedDecision>>,
    cache_ttl: Duration,
    events: EventBus<PermissionEvent>,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl PermissionEngine {
    /// Create an engine with no policies registered.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            events: EventBus::new(1024),
        }
    }

    /// Create an engine pre-loaded with [`builtin_policies`].
    pub fn with_builtin_policies(cache_ttl: Duration) -> Self {
        let engine = Self::new(cache_ttl);
        for policy in builtin_policies() {
            engine.register_policy(policy);
        }
        engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    // ── Policies ───────────────────────────────────────────────

    /// Register a policy, overwriting any existing policy with the same name.
    pub fn register_policy(&self, policy: PermissionPolicy) {
        debug!(permission = %policy.name, level = %policy.level, "registering permission policy");
        let name = policy.name.clone();
        self.policies.write().insert(name.clone(), policy);
        self.cache.lock().retain(|k, _| k.permission != name);
    }

    pub fn get_policy(&self, name: &str) -> Option<PermissionPolicy> {
        self.policies.read().get(name).cloned()
    }

    pub fn list_policies(&self) -> Vec<PermissionPolicy> {
        let mut policies: Vec<_> = self.policies.read().values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    // ── Grants ─────────────────────────────────────────────────

    /// Create (or overwrite) the grant of `permission` to `extension`.
    pub fn grant_permission(
        &self,
        extension: &ExtensionId,
        permission: &str,
        options: GrantOptions,
    ) -> Result<PermissionGrant> {
        if !self.policies.read().contains_key(permission) {
            return Err(LinchError::UnknownPermission(permission.to_string()));
        }

        let grant = options.into_grant(extension.clone(), permission.to_string());
        self.grants
            .lock()
            .entry(extension.clone())
            .or_default()
            .insert(permission.to_string(), grant.clone());
        self.clear_cache_for(extension, Some(permission));

        info!(extension = %extension, permission, granted_by = %grant.granted_by, "permission granted");
        self.events.publish(PermissionEvent::Assigned {
            extension: extension.clone(),
            permission: permission.to_string(),
            granted_by: grant.granted_by.clone(),
        });
        Ok(grant)
    }

    /// Grant every declared permission that can be granted without asking.
    ///
    /// Unknown permissions land in `denied`; permissions whose policy needs
    /// user confirmation land in `requires_confirmation` unless
    /// `options.auto_grant` is set.
    pub fn grant_extension_permissions<I, S>(
        &self,
        extension: &ExtensionId,
        permissions: I,
        options: GrantOptions,
    ) -> PermissionPartition
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut partition = PermissionPartition::default();

        for permission in permissions {
            let permission = permission.as_ref();
            let needs_confirmation = match self.policies.read().get(permission) {
                Some(policy) => policy.requires_user_confirmation,
                None => {
                    warn!(extension = %extension, permission, "extension declares unknown permission");
                    partition.denied.push(permission.to_string());
                    continue;
                }
            };

            if needs_confirmation && !options.auto_grant {
                partition.requires_confirmation.push(permission.to_string());
                continue;
            }

            match self.grant_permission(extension, permission, options.clone()) {
                Ok(_) => partition.granted.push(permission.to_string()),
                Err(_) => partition.denied.push(permission.to_string()),
            }
        }

        partition
    }

    /// Delete a grant. Returns whether one existed.
    pub fn revoke_permission(&self, extension: &ExtensionId, permission: &str) -> bool {
        let removed = {
            let mut grants = self.grants.lock();
            let removed = grants
                .get_mut(extension)
                .and_then(|g| g.remove(permission))
                .is_some();
            if grants.get(extension).is_some_and(|g| g.is_empty()) {
                grants.remove(extension);
            }
            removed
        };

        // Cached decisions of other permissions may depend on this one.
        self.clear_cache_for(extension, None);

        if removed {
            info!(extension = %extension, permission, "permission revoked");
            self.events.publish(PermissionEvent::Revoked {
                extension: extension.clone(),
                permission: permission.to_string(),
            });
        }
        removed
    }

    /// Delete every grant held by `extension`. Returns how many were removed.
    pub fn revoke_all_permissions(&self, extension: &ExtensionId) -> usize {
        let removed = self.grants.lock().remove(extension).unwrap_or_default();
        self.clear_cache_for(extension, None);

        let mut names: Vec<_> = removed.into_keys().collect();
        names.sort();
        for permission in &names {
            self.events.publish(PermissionEvent::Revoked {
                extension: extension.clone(),
                permission: permission.clone(),
            });
        }
        if !names.is_empty() {
            info!(extension = %extension, count = names.len(), "all permissions revoked");
        }
        names.len()
    }

    /// Current grants of an extension, sorted by permission name.
    pub fn get_extension_grants(&self, extension: &ExtensionId) -> Vec<PermissionGrant> {
        let mut grants: Vec<_> = self
            .grants
            .lock()
            .get(extension)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default();
        grants.sort_by(|a, b| a.permission.cmp(&b.permission));
        grants
    }

    /// Whether a grant record exists, regardless of expiry, quota, or dependencies.
    pub fn has_grant(&self, extension: &ExtensionId, permission: &str) -> bool {
        self.grants
            .lock()
            .get(extension)
            .is_some_and(|g| g.contains_key(permission))
    }

    /// Remove every expired grant. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let mut grants = self.grants.lock();
            for (extension, held) in grants.iter_mut() {
                held.retain(|permission, grant| {
                    if grant.is_expired(now) {
                        expired.push((extension.clone(), permission.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            grants.retain(|_, held| !held.is_empty());
        }

        for (extension, permission) in &expired {
            self.clear_cache_for(extension, None);
            self.publish_check(CheckKind::Expired, extension, permission, None);
        }
        expired.len()
    }

    // ── Checks ─────────────────────────────────────────────────

    /// May `extension` use `permission` right now?
    ///
    /// Never fails: every problem (no grant, expiry, exhausted quota, a
    /// missing dependency, a validator error) is a denial.
    pub async fn check_permission(
        &self,
        extension: &ExtensionId,
        permission: &str,
        context: &PermissionContext,
    ) -> bool {
        let mut visiting = HashSet::new();
        self.check_inner(extension, permission, context, &mut visiting)
            .await
    }

    /// Like [`check_permission`](Self::check_permission) but returns the
    /// `PERMISSION_DENIED` error used by guarded operations.
    pub async fn require_permission(
        &self,
        extension: &ExtensionId,
        permission: &str,
        context: &PermissionContext,
    ) -> Result<()> {
        if self.check_permission(extension, permission, context).await {
            Ok(())
        } else {
            Err(LinchError::PermissionDenied {
                extension: extension.clone(),
                permission: permission.to_string(),
            })
        }
    }

    fn check_inner<'a>(
        &'a self,
        extension: &'a ExtensionId,
        permission: &'a str,
        context: &'a PermissionContext,
        visiting: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let key = CacheKey {
                extension: extension.clone(),
                permission: permission.to_string(),
                context: context.cache_key(),
            };

            if let Some(hit) = self.cache.lock().get(&key).copied() {
                if hit.valid_until > Instant::now() {
                    debug!(extension = %extension, permission, "permission cache hit");
                    return true;
                }
            }

            // `visiting` holds the current dependency chain only, so a
            // permission shared by two branches is checked on both.
            if !visiting.insert(permission.to_string()) {
                self.deny(extension, permission, "circular permission dependency");
                return false;
            }
            let allowed = self
                .check_on_chain(extension, permission, context, visiting, key)
                .await;
            visiting.remove(permission);
            allowed
        })
    }

    async fn check_on_chain(
        &self,
        extension: &ExtensionId,
        permission: &str,
        context: &PermissionContext,
        visiting: &mut HashSet<String>,
        key: CacheKey,
    ) -> bool {
        let grant = match self.lookup_grant(extension, permission) {
            Some(grant) => grant,
            None => {
                self.deny(extension, permission, "permission not granted");
                return false;
            }
        };

        if grant.is_expired(Utc::now()) {
            self.expire(extension, permission);
            return false;
        }

        if grant.is_exhausted() {
            self.publish_check(
                CheckKind::UsageExceeded,
                extension,
                permission,
                Some(format!(
                    "usage limit {} reached",
                    grant.usage_limit.unwrap_or_default()
                )),
            );
            return false;
        }

        let policy = match self.get_policy(permission) {
            Some(policy) => policy,
            None => {
                self.deny(extension, permission, "no policy registered");
                return false;
            }
        };

        for dependency in &policy.dependencies {
            if !self
                .check_inner(extension, dependency, context, visiting)
                .await
            {
                self.deny(
                    extension,
                    permission,
                    &format!("dependency {} not satisfied", dependency),
                );
                return false;
            }
        }

        if let Some(validator) = &policy.validator {
            match validator.validate(extension, permission, context).await {
                Ok(true) => {}
                Ok(false) => {
                    self.deny(extension, permission, "rejected by validator");
                    return false;
                }
                Err(e) => {
                    self.deny(extension, permission, &format!("validator error: {e}"));
                    return false;
                }
            }
        }

        // Re-read and increment atomically; the grant may have changed
        // while the validator was running.
        let cacheable_until = {
            let mut grants = self.grants.lock();
            let Some(grant) = grants
                .get_mut(extension)
                .and_then(|g| g.get_mut(permission))
            else {
                drop(grants);
                self.deny(extension, permission, "permission revoked during check");
                return false;
            };
            if grant.is_exhausted() {
                let limit = grant.usage_limit.unwrap_or_default();
                drop(grants);
                self.publish_check(
                    CheckKind::UsageExceeded,
                    extension,
                    permission,
                    Some(format!("usage limit {limit} reached")),
                );
                return false;
            }
            grant.usage_count += 1;
            self.cache_horizon(grant)
        };

        if let Some(valid_until) = cacheable_until {
            self.cache
                .lock()
                .insert(key, CachedDecision { valid_until });
        }

        self.publish_check(CheckKind::Granted, extension, permission, None);
        true
    }

    fn lookup_grant(&self, extension: &ExtensionId, permission: &str) -> Option<PermissionGrant> {
        self.grants
            .lock()
            .get(extension)
            .and_then(|g| g.get(permission))
            .cloned()
    }

    /// How long a positive decision for this grant may be served from cache.
    /// Quota-bound grants are never cached so every use is counted.
    fn cache_horizon(&self, grant: &PermissionGrant) -> Option<Instant> {
        if grant.usage_limit.is_some() {
            return None;
        }
        let mut ttl = self.cache_ttl;
        if let Some(expires_at) = grant.expires_at.filter(|_| !grant.permanent) {
            let remaining = (expires_at - Utc::now()).to_std().ok()?;
            ttl = ttl.min(remaining);
        }
        if ttl.is_zero() {
            return None;
        }
        Some(Instant::now() + ttl)
    }

    fn expire(&self, extension: &ExtensionId, permission: &str) {
        {
            let mut grants = self.grants.lock();
            if let Some(held) = grants.get_mut(extension) {
                held.remove(permission);
                if held.is_empty() {
                    grants.remove(extension);
                }
            }
        }
        self.clear_cache_for(extension, None);
        info!(extension = %extension, permission, "permission grant expired");
        self.publish_check(
            CheckKind::Expired,
            extension,
            permission,
            Some("grant expired".into()),
        );
    }

    fn deny(&self, extension: &ExtensionId, permission: &str, reason: &str) {
        debug!(extension = %extension, permission, reason, "permission denied");
        self.publish_check(
            CheckKind::Denied,
            extension,
            permission,
            Some(reason.to_string()),
        );
    }

    fn publish_check(
        &self,
        kind: CheckKind,
        extension: &ExtensionId,
        permission: &str,
        reason: Option<String>,
    ) {
        self.events.publish(PermissionEvent::Check(PermissionCheck {
            kind,
            extension: extension.clone(),
            permission: permission.to_string(),
            reason,
        }));
    }

    fn clear_cache_for(&self, extension: &ExtensionId, permission: Option<&str>) {
        self.cache.lock().retain(|k, _| {
            &k.extension != extension || permission.is_some_and(|p| k.permission != p)
        });
    }
}
