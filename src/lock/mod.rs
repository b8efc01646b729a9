//! Lock enforcement
//!
//! Locks name targets (user, role, device, access request, server) that
//! forbid issuance and access while in force. The watcher keeps an
//! in-memory view refreshed from the backend and answers "is any of these
//! targets locked?" synchronously.

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::roles::LockingMode;
use crate::types::strip_host_suffix;
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// What a lock applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LockTarget {
    /// A username
    User(String),
    /// A role name
    Role(String),
    /// An MFA device ID
    MfaDevice(String),
    /// A trusted device ID
    TrustedDevice(String),
    /// A server, by bare UUID or `"uuid.cluster"` FQDN
    ServerId(String),
    /// An access-request ID
    AccessRequest(String),
    /// Legacy node target; matched like a server ID
    Node(String),
}

impl LockTarget {
    /// Whether a lock with this target applies to `candidate`.
    ///
    /// Server IDs match both the bare UUID and the FQDN form; the legacy
    /// node target keeps the same matching rule so old locks stay
    /// effective.
    pub fn matches(&self, candidate: &LockTarget, cluster: &str) -> bool {
        match (self, candidate) {
            (Self::User(a), Self::User(b))
            | (Self::Role(a), Self::Role(b))
            | (Self::MfaDevice(a), Self::MfaDevice(b))
            | (Self::TrustedDevice(a), Self::TrustedDevice(b))
            | (Self::AccessRequest(a), Self::AccessRequest(b)) => a == b,
            (
                Self::ServerId(a) | Self::Node(a),
                Self::ServerId(b) | Self::Node(b),
            ) => strip_host_suffix(a, cluster) == strip_host_suffix(b, cluster),
            _ => false,
        }
    }
}

/// A lock record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    /// Unique lock name
    pub name: String,
    /// Target the lock applies to
    pub target: LockTarget,
    /// Human-readable reason surfaced in denials
    pub message: Option<String>,
    /// Expiry; `None` keeps the lock in force until deleted
    pub expires: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Lock {
    /// Whether the lock is in force at `now`
    pub fn in_force(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(expires) => now < expires,
            None => true,
        }
    }
}

fn lock_key(name: &str) -> String {
    format!("locks/{name}")
}

struct WatcherState {
    locks: HashMap<String, Lock>,
    fetched_at: Option<DateTime<Utc>>,
    stale: bool,
}

/// In-memory view of in-force locks
pub struct LockWatcher {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    cluster: String,
    max_staleness: Duration,
    state: RwLock<WatcherState>,
}

impl LockWatcher {
    /// A watcher over the given backend. The view starts stale; call
    /// [`refresh`](Self::refresh) (or run the refresh loop) before serving.
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, cluster: impl Into<String>) -> Self {
        Self {
            backend,
            clock,
            cluster: cluster.into(),
            max_staleness: Duration::from_secs(5 * 60),
            state: RwLock::new(WatcherState {
                locks: HashMap::new(),
                fetched_at: None,
                stale: true,
            }),
        }
    }

    /// Override how old a view may grow before it counts as stale
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    /// Rebuild the view from the backend
    pub async fn refresh(&self) -> Result<()> {
        let items = match self.backend.list("locks/").await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "lock refresh failed; marking view stale");
                self.state.write().unwrap().stale = true;
                return Err(e);
            }
        };

        let mut locks = HashMap::new();
        for item in &items {
            let lock: Lock = unmarshal_item(item)?;
            locks.insert(lock.name.clone(), lock);
        }

        let mut state = self.state.write().unwrap();
        state.locks = locks;
        state.fetched_at = Some(self.clock.now());
        state.stale = false;
        debug!(count = state.locks.len(), "lock view refreshed");
        Ok(())
    }

    /// Mark the view stale, as after a lost backend watch
    pub fn mark_stale(&self) {
        self.state.write().unwrap().stale = true;
    }

    fn is_stale(&self, state: &WatcherState) -> bool {
        if state.stale {
            return true;
        }
        match state.fetched_at {
            Some(at) => {
                let age = (self.clock.now() - at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age > self.max_staleness
            }
            None => true,
        }
    }

    /// Fail with `AccessDenied` if any target matches an in-force lock.
    ///
    /// Under [`LockingMode::Strict`] a stale view also fails closed; under
    /// [`LockingMode::BestEffort`] a stale view is permissive and the
    /// current (possibly outdated) view is still consulted.
    pub fn check_lock_in_force(&self, mode: LockingMode, targets: &[LockTarget]) -> Result<()> {
        let state = self.state.read().unwrap();

        if self.is_stale(&state) && mode == LockingMode::Strict {
            return Err(AuthError::access_denied(
                "lock watcher is stale; strict locking denies access",
            ));
        }

        let now = self.clock.now();
        for lock in state.locks.values() {
            if !lock.in_force(now) {
                continue;
            }
            for target in targets {
                if lock.target.matches(target, &self.cluster) {
                    let reason = lock
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("lock {:?} is in force", lock.name));
                    return Err(AuthError::access_denied(format!(
                        "lock targeting {target:?} is in force: {reason}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write a lock and refresh the view
    pub async fn upsert_lock(&self, lock: Lock) -> Result<()> {
        let mut item = marshal_item(lock_key(&lock.name), &lock)?;
        if let Some(expires) = lock.expires {
            item = item.with_expiry(expires);
        }
        self.backend.put(item).await?;
        self.refresh().await
    }

    /// Delete a lock and refresh the view
    pub async fn delete_lock(&self, name: &str) -> Result<()> {
        self.backend.delete(&lock_key(name)).await?;
        self.refresh().await
    }

    /// Run the refresh loop until `shutdown` fires
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;

    fn watcher() -> (Arc<ManualClock>, LockWatcher) {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        (
            clock.clone(),
            LockWatcher::new(backend, clock, "example.com"),
        )
    }

    fn lock(name: &str, target: LockTarget, now: DateTime<Utc>) -> Lock {
        Lock {
            name: name.to_string(),
            target,
            message: None,
            expires: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_user_lock_denies() {
        let (clock, watcher) = watcher();
        watcher.refresh().await.unwrap();
        watcher
            .upsert_lock(lock(
                "l1",
                LockTarget::User("dave".to_string()),
                clock.now(),
            ))
            .await
            .unwrap();

        let err = watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::User("dave".to_string())],
            )
            .unwrap_err();
        assert!(err.is_access_denied());

        watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::User("erin".to_string())],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_id_matches_both_forms() {
        let (clock, watcher) = watcher();
        watcher.refresh().await.unwrap();
        watcher
            .upsert_lock(lock(
                "l1",
                LockTarget::ServerId("8a2b1c".to_string()),
                clock.now(),
            ))
            .await
            .unwrap();

        for form in ["8a2b1c", "8a2b1c.example.com"] {
            let err = watcher
                .check_lock_in_force(
                    LockingMode::BestEffort,
                    &[LockTarget::ServerId(form.to_string())],
                )
                .unwrap_err();
            assert!(err.is_access_denied(), "form {form:?} should match");
        }

        // Legacy node targets keep matching server IDs
        let err = watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::Node("8a2b1c.example.com".to_string())],
            )
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn test_stale_strict_fails_closed() {
        let (_, watcher) = watcher();

        // Never refreshed: strict fails, best-effort passes
        let err = watcher
            .check_lock_in_force(
                LockingMode::Strict,
                &[LockTarget::User("dave".to_string())],
            )
            .unwrap_err();
        assert!(err.is_access_denied());

        watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::User("dave".to_string())],
            )
            .unwrap();

        watcher.refresh().await.unwrap();
        watcher
            .check_lock_in_force(LockingMode::Strict, &[LockTarget::User("dave".to_string())])
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_not_in_force() {
        let (clock, watcher) = watcher();
        watcher.refresh().await.unwrap();
        let mut l = lock("l1", LockTarget::Role("ops".to_string()), clock.now());
        l.expires = Some(clock.now() + chrono::Duration::minutes(5));
        watcher.upsert_lock(l).await.unwrap();

        assert!(watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::Role("ops".to_string())]
            )
            .is_err());

        clock.advance(chrono::Duration::minutes(6));
        watcher
            .check_lock_in_force(
                LockingMode::BestEffort,
                &[LockTarget::Role("ops".to_string())],
            )
            .unwrap();
    }
}
