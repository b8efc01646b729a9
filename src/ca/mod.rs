//! Certificate authority records
//!
//! A [`CertAuthority`] is identified by (type, cluster) and carries two key
//! sets: `active_keys` sign and anchor trust; `additional_trusted_keys` are
//! trusted but not used for signing — the staging area for rotation and for
//! newly provisioned HSM keys. All mutation is CAS-protected against the
//! backend revision.

use crate::backend::{marshal_item, unmarshal_item, Backend, Item};
use crate::keystore::KeyRef;
use crate::types::CertAuthType;
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Identity of a certificate authority
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaId {
    /// CA type
    pub kind: CertAuthType,
    /// Owning cluster
    pub cluster: String,
}

impl CaId {
    /// Construct an ID
    pub fn new(kind: CertAuthType, cluster: impl Into<String>) -> Self {
        Self {
            kind,
            cluster: cluster.into(),
        }
    }

    /// Backend key for this CA
    pub fn backend_key(&self) -> String {
        format!("authorities/{}/{}", self.kind, self.cluster)
    }
}

/// An SSH keypair held by a CA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// Public key in OpenSSH authorized-keys format
    pub public_key: String,
    /// Reference to the private half
    pub private_key: KeyRef,
}

/// A TLS certificate + key held by a CA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsKeyPair {
    /// Self-signed CA certificate, PEM
    pub cert_pem: String,
    /// Reference to the private half
    pub key: KeyRef,
}

/// A JWT signing keypair held by a CA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtKeyPair {
    /// Public key in OpenSSH format
    pub public_key: String,
    /// Reference to the private half
    pub key: KeyRef,
}

/// One of a CA's two key sets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaKeySet {
    /// SSH keypairs, in preference order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh: Vec<SshKeyPair>,
    /// TLS certificate/key pairs, in preference order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<TlsKeyPair>,
    /// JWT keypairs, in preference order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jwt: Vec<JwtKeyPair>,
}

impl CaKeySet {
    /// Whether the set holds no keys at all
    pub fn is_empty(&self) -> bool {
        self.ssh.is_empty() && self.tls.is_empty() && self.jwt.is_empty()
    }

    /// Append every key of `other` to this set
    pub fn merge(&mut self, other: CaKeySet) {
        self.ssh.extend(other.ssh);
        self.tls.extend(other.tls);
        self.jwt.extend(other.jwt);
    }

    /// References to every private key in the set
    pub fn key_refs(&self) -> Vec<KeyRef> {
        let mut refs = Vec::new();
        refs.extend(self.ssh.iter().map(|p| p.private_key.clone()));
        refs.extend(self.tls.iter().map(|p| p.key.clone()));
        refs.extend(self.jwt.iter().map(|p| p.key.clone()));
        refs
    }

    /// Remove every key present in `other`
    pub fn remove_all(&mut self, other: &CaKeySet) {
        self.ssh.retain(|p| !other.ssh.contains(p));
        self.tls.retain(|p| !other.tls.contains(p));
        self.jwt.retain(|p| !other.jwt.contains(p));
    }
}

/// Phase of an in-flight CA rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    /// No rotation in progress
    #[default]
    Standby,
    /// New keys staged into the additional-trusted set
    Init,
    /// Clients are re-fetching trust; old keys still sign
    UpdateClients,
    /// New keys sign; old keys remain trusted
    UpdateServers,
}

impl RotationPhase {
    /// Wire name of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Init => "init",
            Self::UpdateClients => "update_clients",
            Self::UpdateServers => "update_servers",
        }
    }

    /// The phase a rotation advances to from here
    pub fn next(&self) -> RotationPhase {
        match self {
            Self::Standby => Self::Init,
            Self::Init => Self::UpdateClients,
            Self::UpdateClients => Self::UpdateServers,
            Self::UpdateServers => Self::Standby,
        }
    }
}

/// Rotation state stored on the CA
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RotationState {
    /// Current phase
    pub phase: RotationPhase,
    /// When the rotation entered its current phase
    pub started: Option<DateTime<Utc>>,
    /// Grace period before periodic bookkeeping advances the phase
    #[serde(default)]
    pub grace: Duration,
    /// Keys staged at `init`, promoted to active at `update_servers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<CaKeySet>,
}

/// A certificate authority at rest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertAuthority {
    /// Identity
    pub id: CaId,
    /// Keys used for new signatures and trust
    pub active_keys: CaKeySet,
    /// Keys trusted but not signing; append-only between rotations
    pub additional_trusted_keys: CaKeySet,
    /// Rotation state machine
    pub rotation: RotationState,
    /// Backend revision observed at load; not persisted
    #[serde(skip)]
    pub revision: u64,
}

impl CertAuthority {
    /// A CA with the given active key set and empty staging
    pub fn new(id: CaId, active_keys: CaKeySet) -> Self {
        Self {
            id,
            active_keys,
            additional_trusted_keys: CaKeySet::default(),
            rotation: RotationState::default(),
            revision: 0,
        }
    }

    /// References to every key in either set; exactly what the keystore
    /// must retain
    pub fn all_key_refs(&self) -> Vec<KeyRef> {
        let mut refs = self.active_keys.key_refs();
        refs.extend(self.additional_trusted_keys.key_refs());
        refs
    }

    /// Public SSH keys trusted by this CA, active first
    pub fn trusted_ssh_public_keys(&self) -> Vec<String> {
        self.active_keys
            .ssh
            .iter()
            .chain(self.additional_trusted_keys.ssh.iter())
            .map(|p| p.public_key.clone())
            .collect()
    }

    /// PEM certificates trusted by this CA, active first
    pub fn trusted_tls_certs(&self) -> Vec<String> {
        self.active_keys
            .tls
            .iter()
            .chain(self.additional_trusted_keys.tls.iter())
            .map(|p| p.cert_pem.clone())
            .collect()
    }
}

/// Authoritative CA storage over the backend
#[derive(Clone)]
pub struct CaStore {
    backend: Arc<dyn Backend>,
}

impl CaStore {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Fetch a CA; its `revision` reflects the stored item
    pub async fn get(&self, id: &CaId) -> Result<CertAuthority> {
        let item = self.backend.get(&id.backend_key()).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::not_found(format!("certificate authority {}/{} is not found", id.kind, id.cluster))
            } else {
                e
            }
        })?;
        let mut ca: CertAuthority = unmarshal_item(&item)?;
        ca.revision = item.revision;
        Ok(ca)
    }

    /// Create a CA; `AlreadyExists` on collision
    pub async fn create(&self, ca: &CertAuthority) -> Result<u64> {
        let item = marshal_item(ca.id.backend_key(), ca)?;
        self.backend.create(item).await
    }

    /// Replace a CA only if the stored revision still matches
    /// `ca.revision`; `CompareFailed` otherwise
    pub async fn compare_and_swap(&self, ca: &CertAuthority) -> Result<u64> {
        let item = marshal_item(ca.id.backend_key(), ca)?;
        self.backend.compare_and_swap(ca.revision, item).await
    }

    /// Delete a CA
    pub async fn delete(&self, id: &CaId) -> Result<()> {
        self.backend.delete(&id.backend_key()).await
    }

    /// Every CA of the given cluster that exists
    pub async fn all(&self, cluster: &str) -> Result<Vec<CertAuthority>> {
        let mut cas = Vec::new();
        for kind in CertAuthType::ALL {
            match self.get(&CaId::new(kind, cluster)).await {
                Ok(ca) => cas.push(ca),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(cas)
    }
}

/// Read-through CA cache
///
/// Issuance reads CAs through this cache; lifecycle writes go to the
/// embedded authoritative store and invalidate. The cache overrides only
/// the read path.
pub struct CaCache {
    store: CaStore,
    cache: RwLock<HashMap<String, CertAuthority>>,
}

impl CaCache {
    /// Wrap an authoritative store
    pub fn new(store: CaStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The embedded authoritative store
    pub fn store(&self) -> &CaStore {
        &self.store
    }

    /// Cached read; falls through to the store on miss
    pub async fn get(&self, id: &CaId) -> Result<CertAuthority> {
        if let Some(ca) = self.cache.read().unwrap().get(&id.backend_key()) {
            return Ok(ca.clone());
        }
        let ca = self.store.get(id).await?;
        self.cache
            .write()
            .unwrap()
            .insert(id.backend_key(), ca.clone());
        Ok(ca)
    }

    /// Create through the store
    pub async fn create(&self, ca: &CertAuthority) -> Result<u64> {
        let revision = self.store.create(ca).await?;
        self.invalidate(&ca.id);
        Ok(revision)
    }

    /// CAS through the store, invalidating on success
    pub async fn compare_and_swap(&self, ca: &CertAuthority) -> Result<u64> {
        let revision = self.store.compare_and_swap(ca).await?;
        self.invalidate(&ca.id);
        Ok(revision)
    }

    /// Drop one cached entry
    pub fn invalidate(&self, id: &CaId) {
        self.cache.write().unwrap().remove(&id.backend_key());
    }

    /// Drop every cached entry; run by periodic bookkeeping so writes from
    /// other auth instances propagate
    pub fn refresh(&self) {
        self.cache.write().unwrap().clear();
    }
}
