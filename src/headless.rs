//! Headless authentication
//!
//! A pending login keyed by the SSH public key it will certify, approved or
//! denied out of band (typically from an already-authenticated device). The
//! record name is the SHA-256 of the public key's wire encoding, so the
//! approver and the requester derive the same name independently.

use crate::backend::{marshal_item, unmarshal_item, Backend, Item};
use crate::clock::Clock;
use crate::events::{AuditEmitter, AuditEvent};
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh_encoding::Encode;
use ssh_key::PublicKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// How long a pending headless authentication lives
pub const HEADLESS_TTL: Duration = Duration::from_secs(3 * 60);

/// State of a headless authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeadlessState {
    /// Waiting for the approver
    #[default]
    Pending,
    /// Approved with an MFA verification
    Approved,
    /// Denied
    Denied,
}

impl HeadlessState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

/// A headless authentication record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessAuthentication {
    /// Record name; must equal [`headless_name`] of `public_key`
    pub name: String,
    /// User logging in
    pub user: String,
    /// SSH public key to certify, OpenSSH format; empty on a fresh stub
    pub public_key: String,
    /// Client IP the login originated from
    pub client_ip: String,
    /// Current state
    pub state: HeadlessState,
    /// MFA device that approved, set iff `state` is `Approved`
    pub mfa_device: Option<String>,
    /// Expiry
    pub expires: DateTime<Utc>,
    /// Backend revision observed at load; not persisted
    #[serde(skip)]
    pub revision: u64,
}

/// Derive the deterministic record name from a public key
pub fn headless_name(public_key: &PublicKey) -> Result<String> {
    let mut encoded = Vec::new();
    public_key
        .key_data()
        .encode(&mut encoded)
        .map_err(|e| AuthError::bad_parameter(format!("unencodable public key: {e}")))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

fn headless_key(name: &str) -> String {
    format!("headless/{name}")
}

/// Headless authentication storage with update subscriptions
pub struct HeadlessStore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn AuditEmitter>,
    watchers: Mutex<HashMap<String, watch::Sender<HeadlessAuthentication>>>,
}

impl HeadlessStore {
    /// A store over the backend
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        emitter: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            backend,
            clock,
            emitter,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pending stub if none exists; idempotent.
    ///
    /// Returns the stored record either way.
    pub async fn create_stub(&self, name: &str, user: &str) -> Result<HeadlessAuthentication> {
        if name.is_empty() || user.is_empty() {
            return Err(AuthError::bad_parameter(
                "headless authentication requires a name and user",
            ));
        }

        match self.get(name).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let record = HeadlessAuthentication {
            name: name.to_string(),
            user: user.to_string(),
            public_key: String::new(),
            client_ip: String::new(),
            state: HeadlessState::Pending,
            mfa_device: None,
            expires: self.clock.now() + chrono::Duration::seconds(HEADLESS_TTL.as_secs() as i64),
            revision: 0,
        };

        let item = self.marshal(&record)?;
        match self.backend.create(item).await {
            Ok(_) => {}
            // Lost a create race: someone else's stub wins
            Err(e) if e.is_already_exists() => return self.get(name).await,
            Err(e) => return Err(e),
        }
        self.get(name).await
    }

    /// Fetch a record
    pub async fn get(&self, name: &str) -> Result<HeadlessAuthentication> {
        let item = self.backend.get(&headless_key(name)).await?;
        let mut record: HeadlessAuthentication = unmarshal_item(&item)?;
        record.revision = item.revision;
        Ok(record)
    }

    fn marshal(&self, record: &HeadlessAuthentication) -> Result<Item> {
        Ok(marshal_item(headless_key(&record.name), record)?.with_expiry(record.expires))
    }

    /// Replace a record only at its observed revision; the internal
    /// consumer path
    pub async fn compare_and_swap(
        &self,
        expected: &HeadlessAuthentication,
        replacement: HeadlessAuthentication,
    ) -> Result<HeadlessAuthentication> {
        if replacement.name != expected.name {
            return Err(AuthError::bad_parameter(
                "cannot swap a headless authentication under a different name",
            ));
        }
        if !replacement.public_key.is_empty() {
            let key = PublicKey::from_openssh(&replacement.public_key)?;
            if headless_name(&key)? != replacement.name {
                return Err(AuthError::bad_parameter(
                    "headless authentication name does not match its public key",
                ));
            }
        }

        let item = self.marshal(&replacement)?;
        let revision = self.backend.compare_and_swap(expected.revision, item).await?;

        let mut stored = replacement;
        stored.revision = revision;
        self.notify(&stored);
        Ok(stored)
    }

    /// Approve or deny a pending record.
    ///
    /// Approval requires the MFA device that verified the approver. The
    /// record must still be pending.
    pub async fn update_state(
        &self,
        name: &str,
        state: HeadlessState,
        mfa_device: Option<String>,
    ) -> Result<HeadlessAuthentication> {
        match state {
            HeadlessState::Pending => {
                return Err(AuthError::bad_parameter(
                    "cannot update a headless authentication back to pending",
                ));
            }
            HeadlessState::Approved if mfa_device.is_none() => {
                return Err(AuthError::access_denied(
                    "headless approval requires MFA verification",
                ));
            }
            _ => {}
        }

        let current = self.get(name).await?;
        if current.state != HeadlessState::Pending {
            return Err(AuthError::bad_parameter(format!(
                "headless authentication is already {}",
                current.state.as_str()
            )));
        }

        let mut updated = current.clone();
        updated.state = state;
        updated.mfa_device = if state == HeadlessState::Approved {
            mfa_device
        } else {
            None
        };

        let stored = self.compare_and_swap(&current, updated).await?;
        let _ = self
            .emitter
            .emit(AuditEvent::HeadlessAuthenticationUpdated {
                name: stored.name.clone(),
                user: stored.user.clone(),
                state: stored.state.as_str().to_string(),
            })
            .await;
        Ok(stored)
    }

    /// Subscribe to updates for one record. The receiver yields the current
    /// record immediately and every subsequent state change.
    pub async fn subscribe(&self, name: &str) -> Result<watch::Receiver<HeadlessAuthentication>> {
        let current = self.get(name).await?;
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(sender) = watchers.get(name) {
            return Ok(sender.subscribe());
        }
        let (tx, rx) = watch::channel(current);
        watchers.insert(name.to_string(), tx);
        Ok(rx)
    }

    fn notify(&self, record: &HeadlessAuthentication) {
        let watchers = self.watchers.lock().unwrap();
        if let Some(sender) = watchers.get(&record.name) {
            let _ = sender.send(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::events::RecordingEmitter;
    use rand::rngs::OsRng;
    use ssh_key::{Algorithm, PrivateKey};

    fn store() -> HeadlessStore {
        let clock = Arc::new(ManualClock::default());
        HeadlessStore::new(
            Arc::new(MemoryBackend::new(clock.clone())),
            clock,
            Arc::new(RecordingEmitter::new()),
        )
    }

    fn public_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[tokio::test]
    async fn test_stub_is_idempotent() {
        let store = store();
        let key = public_key();
        let name = headless_name(&key).unwrap();

        let first = store.create_stub(&name, "alice").await.unwrap();
        let second = store.create_stub(&name, "alice").await.unwrap();
        assert_eq!(first.revision, second.revision);
        assert_eq!(second.state, HeadlessState::Pending);
    }

    #[tokio::test]
    async fn test_name_must_match_public_key() {
        let store = store();
        let key = public_key();
        let name = headless_name(&key).unwrap();
        let stub = store.create_stub(&name, "alice").await.unwrap();

        // Swapping in a different key under this name is rejected
        let other = public_key();
        let mut wrong = stub.clone();
        wrong.public_key = other.to_openssh().unwrap();
        let err = store.compare_and_swap(&stub, wrong).await.unwrap_err();
        assert!(err.is_bad_parameter());

        // The matching key is accepted
        let mut right = stub.clone();
        right.public_key = key.to_openssh().unwrap();
        store.compare_and_swap(&stub, right).await.unwrap();
    }

    #[tokio::test]
    async fn test_approval_requires_mfa_and_single_transition() {
        let store = store();
        let key = public_key();
        let name = headless_name(&key).unwrap();
        store.create_stub(&name, "alice").await.unwrap();

        let err = store
            .update_state(&name, HeadlessState::Approved, None)
            .await
            .unwrap_err();
        assert!(err.is_access_denied());

        let approved = store
            .update_state(&name, HeadlessState::Approved, Some("device-1".to_string()))
            .await
            .unwrap();
        assert_eq!(approved.state, HeadlessState::Approved);

        // A second transition is rejected
        let err = store
            .update_state(&name, HeadlessState::Denied, None)
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let store = store();
        let key = public_key();
        let name = headless_name(&key).unwrap();
        store.create_stub(&name, "alice").await.unwrap();

        let mut rx = store.subscribe(&name).await.unwrap();
        assert_eq!(rx.borrow().state, HeadlessState::Pending);

        store
            .update_state(&name, HeadlessState::Denied, None)
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, HeadlessState::Denied);
    }
}
