//! Role and user snapshots consumed by issuance
//!
//! These are the projections of user/role records the pipeline needs: login
//! lists, TTL caps, locking modes, private key policies. Resolution of role
//! templates and trait interpolation happens upstream of the core.

use crate::types::{CertificateFormat, PrivateKeyPolicy, UserType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How lock staleness is treated when checking this principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// A stale lock view is permissive
    #[default]
    BestEffort,
    /// A stale lock view fails closed
    Strict,
}

impl LockingMode {
    /// The stricter of two modes
    pub fn strictest(self, other: Self) -> Self {
        if self == Self::Strict || other == Self::Strict {
            Self::Strict
        } else {
            Self::BestEffort
        }
    }
}

/// A role granting logins and governing session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Role name, unique in the cluster
    pub name: String,
    /// SSH logins this role grants
    pub logins: Vec<String>,
    /// Per-role session TTL ceiling
    pub max_session_ttl: Duration,
    /// Lock staleness treatment for holders of this role
    pub locking_mode: LockingMode,
    /// Private key policy this role demands
    pub private_key_policy: PrivateKeyPolicy,
    /// Certificate format override; `None` defers to the set default
    pub cert_format: Option<CertificateFormat>,
    /// Whether certificates for this role pin the client IP
    pub pin_source_ip: bool,
}

impl Role {
    /// A role with the given name and logins and default knobs
    pub fn new(name: impl Into<String>, logins: Vec<String>, max_session_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            logins,
            max_session_ttl,
            locking_mode: LockingMode::default(),
            private_key_policy: PrivateKeyPolicy::None,
            cert_format: None,
            pin_source_ip: false,
        }
    }
}

/// The set of roles in effect for one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSet(pub Vec<Role>);

impl RoleSet {
    /// Build a set from roles
    pub fn new(roles: Vec<Role>) -> Self {
        Self(roles)
    }

    /// Role names, in set order
    pub fn role_names(&self) -> Vec<String> {
        self.0.iter().map(|r| r.name.clone()).collect()
    }

    /// The largest session TTL any role allows; zero for an empty set
    pub fn max_session_ttl(&self) -> Duration {
        self.0
            .iter()
            .map(|r| r.max_session_ttl)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Clamp a requested TTL to the set ceiling
    pub fn adjust_session_ttl(&self, requested: Duration) -> Duration {
        requested.min(self.max_session_ttl())
    }

    /// Logins usable at `ttl`: the union of logins from roles whose ceiling
    /// covers the TTL, deduplicated in first-seen order. A zero `ttl`
    /// disables the cap and unions every role's logins.
    pub fn checked_logins(&self, ttl: Duration) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut logins = Vec::new();
        for role in &self.0 {
            if !ttl.is_zero() && role.max_session_ttl < ttl {
                continue;
            }
            for login in &role.logins {
                if seen.insert(login.clone()) {
                    logins.push(login.clone());
                }
            }
        }
        logins
    }

    /// The strictest locking mode in the set, defaulting to `fallback`
    pub fn locking_mode(&self, fallback: LockingMode) -> LockingMode {
        self.0
            .iter()
            .fold(fallback, |acc, r| acc.strictest(r.locking_mode))
    }

    /// The strictest private key policy of the cluster and every role
    pub fn private_key_policy(&self, cluster: PrivateKeyPolicy) -> PrivateKeyPolicy {
        self.0
            .iter()
            .fold(cluster, |acc, r| acc.strictest(r.private_key_policy))
    }

    /// The set's certificate format: the first explicit role override wins
    pub fn cert_format(&self) -> CertificateFormat {
        self.0
            .iter()
            .find_map(|r| r.cert_format)
            .unwrap_or_default()
    }

    /// Whether any role demands IP pinning
    pub fn pin_source_ip(&self) -> bool {
        self.0.iter().any(|r| r.pin_source_ip)
    }
}

/// Login attempt history kept on the user record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStatus {
    /// Administrative lock flag
    pub is_locked: bool,
    /// When a lockout ends; `None` for an indefinite administrative lock
    pub locked_until: Option<DateTime<Utc>>,
    /// Human-readable lock reason
    pub lock_reason: Option<String>,
    /// Timestamps of recent consecutive failed login attempts
    pub failed_attempts: Vec<DateTime<Utc>>,
}

impl UserStatus {
    /// Whether the user is locked at `now`
    pub fn locked_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_locked {
            return false;
        }
        match self.locked_until {
            Some(until) => now < until,
            None => true,
        }
    }
}

/// A stored user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Username, unique in the cluster
    pub name: String,
    /// Statically assigned role names
    pub roles: Vec<String>,
    /// External traits (group memberships, logins from the IdP, ...)
    pub traits: BTreeMap<String, Vec<String>>,
    /// Local or SSO
    pub user_type: UserType,
    /// Lock and attempt state
    pub status: UserStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Backend revision observed at load; not persisted
    #[serde(skip)]
    pub revision: u64,
}

impl User {
    /// A local user with the given name and roles
    pub fn new(name: impl Into<String>, roles: Vec<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            roles,
            traits: BTreeMap::new(),
            user_type: UserType::Local,
            status: UserStatus::default(),
            created_at,
            revision: 0,
        }
    }
}

/// Backend key for a user record
pub fn user_key(name: &str) -> String {
    format!("users/{name}/params")
}

/// Backend key prefix for a user's MFA devices
pub fn user_devices_prefix(name: &str) -> String {
    format!("users/{name}/devices/")
}

/// Backend key for a role record
pub fn role_key(name: &str) -> String {
    format!("roles/{name}")
}

/// Role storage over the backend
#[derive(Clone)]
pub struct RoleStore {
    backend: std::sync::Arc<dyn crate::backend::Backend>,
}

impl RoleStore {
    /// Wrap a backend
    pub fn new(backend: std::sync::Arc<dyn crate::backend::Backend>) -> Self {
        Self { backend }
    }

    /// Write a role
    pub async fn upsert(&self, role: &Role) -> crate::Result<u64> {
        let item = crate::backend::marshal_item(role_key(&role.name), role)?;
        self.backend.put(item).await
    }

    /// Fetch a role
    pub async fn get(&self, name: &str) -> crate::Result<Role> {
        let item = self.backend.get(&role_key(name)).await.map_err(|e| {
            if e.is_not_found() {
                crate::AuthError::not_found(format!("role {name:?} is not found"))
            } else {
                e
            }
        })?;
        crate::backend::unmarshal_item(&item)
    }

    /// Resolve a list of role names into a set, in the given order
    pub async fn resolve(&self, names: &[String]) -> crate::Result<RoleSet> {
        let mut roles = Vec::with_capacity(names.len());
        for name in names {
            roles.push(self.get(name).await?);
        }
        Ok(RoleSet::new(roles))
    }

    /// Delete a role
    pub async fn delete(&self, name: &str) -> crate::Result<()> {
        self.backend.delete(&role_key(name)).await
    }
}

/// User storage over the backend
#[derive(Clone)]
pub struct UserStore {
    backend: std::sync::Arc<dyn crate::backend::Backend>,
}

impl UserStore {
    /// Wrap a backend
    pub fn new(backend: std::sync::Arc<dyn crate::backend::Backend>) -> Self {
        Self { backend }
    }

    /// Create a user; `AlreadyExists` on collision
    pub async fn create(&self, user: &User) -> crate::Result<u64> {
        let item = crate::backend::marshal_item(user_key(&user.name), user)?;
        self.backend.create(item).await
    }

    /// Fetch a user; `revision` reflects the stored item
    pub async fn get(&self, name: &str) -> crate::Result<User> {
        let item = self.backend.get(&user_key(name)).await.map_err(|e| {
            if e.is_not_found() {
                crate::AuthError::not_found(format!("user {name:?} is not found"))
            } else {
                e
            }
        })?;
        let mut user: User = crate::backend::unmarshal_item(&item)?;
        user.revision = item.revision;
        Ok(user)
    }

    /// Write a user unconditionally
    pub async fn upsert(&self, user: &User) -> crate::Result<u64> {
        let item = crate::backend::marshal_item(user_key(&user.name), user)?;
        self.backend.put(item).await
    }

    /// Replace a user only at its observed revision
    pub async fn compare_and_swap(&self, user: &User) -> crate::Result<u64> {
        let item = crate::backend::marshal_item(user_key(&user.name), user)?;
        self.backend.compare_and_swap(user.revision, item).await
    }

    /// Delete a user record
    pub async fn delete(&self, name: &str) -> crate::Result<()> {
        self.backend.delete(&user_key(name)).await
    }
}
