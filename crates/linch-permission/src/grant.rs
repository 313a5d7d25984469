use chrono::{DateTime, Duration, Utc};
use linch_core::ExtensionId;
use serde::{Deserialize, Serialize};

/// Record that an extension currently holds a permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub extension: ExtensionId,
    pub permission: String,
    pub granted_at: DateTime<Utc>,
    pub granted_by: String,
    pub permanent: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_limit: Option<u64>,
    #[serde(default)]
    pub usage_count: u64,
}

impl PermissionGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.permanent && self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_limit
            .is_some_and(|limit| self.usage_count >= limit)
    }
}

/// Options for creating a grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantOptions {
    pub granted_by: String,
    pub permanent: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<u64>,
    /// Bulk grants only: grant permissions that would otherwise need user confirmation.
    pub auto_grant: bool,
}

impl Default for GrantOptions {
    fn default() -> Self {
        Self {
            granted_by: "system".into(),
            permanent: false,
            expires_at: None,
            usage_limit: None,
            auto_grant: false,
        }
    }
}

impl GrantOptions {
    pub fn granted_by(mut self, who: impl Into<String>) -> Self {
        self.granted_by = who.into();
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self.expires_at = None;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self.permanent = false;
        self
    }

    pub fn expires_in(self, ttl: Duration) -> Self {
        self.expires_at(Utc::now() + ttl)
    }

    pub fn usage_limit(mut self, limit: u64) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    pub fn auto_grant(mut self) -> Self {
        self.auto_grant = true;
        self
    }

    pub(crate) fn into_grant(self, extension: ExtensionId, permission: String) -> PermissionGrant {
        PermissionGrant {
            extension,
            permission,
            granted_at: Utc::now(),
            granted_by: self.granted_by,
            permanent: self.permanent,
            expires_at: if self.permanent { None } else { self.expires_at },
            usage_limit: self.usage_limit,
            usage_count: 0,
        }
    }
}
