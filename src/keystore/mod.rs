//! KeyStore Manager
//!
//! Owns CA private key material across three backings: software keys stored
//! inline in the CA record, PKCS#11 tokens scoped to the auth instance that
//! created them, and cloud KMS keyrings. Produces signers on demand and
//! garbage-collects keys no CA references.
//!
//! Hardware and KMS operations go through the [`RemoteKeyBacking`]
//! capability, swappable at startup. When the capability is absent the
//! backing is disabled by build/license and key generation fails with
//! `NotImplemented`; selection and garbage-collection semantics remain fully
//! in force for references already present on CAs.

use crate::ca::{CaKeySet, CertAuthority, JwtKeyPair, SshKeyPair, TlsKeyPair};
use crate::clock::Clock;
use crate::config::KeyStoreBackingConfig;
use crate::types::CertAuthType;
use crate::{AuthError, Result};
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reference to a CA private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backing", rename_all = "snake_case")]
pub enum KeyRef {
    /// Key material stored inline, usable by every auth instance
    Software {
        /// PEM/OpenSSH-encoded private key
        private_key_pem: String,
    },
    /// Key resident in a PKCS#11 token on one auth instance
    Hsm {
        /// Token slot
        slot: u32,
        /// Key label within the slot
        label: String,
        /// Auth instance that created the key; only that instance can sign
        host_id: Uuid,
    },
    /// Key resident in a cloud KMS
    Kms {
        /// Fully qualified key resource name
        resource: String,
    },
}

impl KeyRef {
    /// The backing this reference belongs to
    pub fn backing(&self) -> BackingKind {
        match self {
            Self::Software { .. } => BackingKind::Software,
            Self::Hsm { .. } => BackingKind::Hsm,
            Self::Kms { .. } => BackingKind::Kms,
        }
    }
}

/// Kind of key backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingKind {
    /// Inline software keys
    Software,
    /// PKCS#11 token
    Hsm,
    /// Cloud KMS
    Kms,
}

/// Kind of key a remote backing is asked to mint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKeyKind {
    /// SSH signing key
    Ssh,
    /// TLS CA key (the backing returns a self-signed CA certificate as the
    /// public half)
    Tls,
    /// JWT signing key
    Jwt,
}

/// Parameters for minting a remote key
#[derive(Debug, Clone)]
pub struct RemoteKeyRequest {
    /// PKCS#11 slot, for HSM backings
    pub slot: Option<u32>,
    /// Auth instance the key is scoped to, for HSM backings
    pub host_id: Uuid,
    /// KMS keyring, for KMS backings
    pub keyring: Option<String>,
    /// Subject common name for TLS CA keys
    pub common_name: String,
}

/// Capability producing and operating keys resident outside process memory.
///
/// Implementations back references with token- or KMS-resident keys; the
/// signer values they return may be adapters whose operations round-trip to
/// the token. The core never persists the private half of a remote key.
#[async_trait]
pub trait RemoteKeyBacking: Send + Sync {
    /// Mint a key, returning its public half and reference
    async fn generate(&self, kind: RemoteKeyKind, req: &RemoteKeyRequest)
        -> Result<(String, KeyRef)>;

    /// Materialize an SSH signer for a reference owned by this backing
    async fn ssh_signer(&self, key: &KeyRef) -> Result<PrivateKey>;

    /// Materialize a TLS signer for a reference owned by this backing
    async fn tls_signer(&self, key: &KeyRef) -> Result<rcgen::KeyPair>;

    /// Materialize a JWT signer for a reference owned by this backing
    async fn jwt_signer(&self, key: &KeyRef) -> Result<ed25519_dalek::SigningKey>;

    /// Every key the backing currently holds
    async fn list_keys(&self) -> Result<Vec<KeyRef>>;

    /// Destroy one key
    async fn delete_key(&self, key: &KeyRef) -> Result<()>;
}

/// Pool of precomputed software keys
///
/// Ed25519 generation is cheap but not free; the pool keeps a few keys warm
/// so bursts of CA provisioning do not serialize on key generation. Filled
/// by periodic bookkeeping; init-once at startup, stubbed in tests.
pub struct SoftwareKeyPool {
    keys: Mutex<Vec<PrivateKey>>,
    target: usize,
}

impl SoftwareKeyPool {
    /// A pool that keeps `target` keys warm
    pub fn new(target: usize) -> Self {
        Self {
            keys: Mutex::new(Vec::new()),
            target,
        }
    }

    /// Take a key, generating inline when the pool is dry
    pub fn take(&self) -> Result<PrivateKey> {
        if let Some(key) = self.keys.lock().unwrap().pop() {
            return Ok(key);
        }
        Ok(PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?)
    }

    /// Top the pool back up to its target size
    pub fn refill(&self) -> Result<()> {
        loop {
            {
                let keys = self.keys.lock().unwrap();
                if keys.len() >= self.target {
                    return Ok(());
                }
            }
            // Generate outside the lock
            let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
            self.keys.lock().unwrap().push(key);
        }
    }

    /// Keys currently warm
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SoftwareKeyPool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// The keystore manager
pub struct KeyStore {
    cluster: String,
    host_id: Uuid,
    backing: KeyStoreBackingConfig,
    remote: Option<Arc<dyn RemoteKeyBacking>>,
    pool: Arc<SoftwareKeyPool>,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    /// A keystore for this auth instance
    pub fn new(
        cluster: impl Into<String>,
        host_id: Uuid,
        backing: KeyStoreBackingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            host_id,
            backing,
            remote: None,
            pool: Arc::new(SoftwareKeyPool::default()),
            clock,
        }
    }

    /// Install the remote backing capability
    pub fn with_remote_backing(mut self, remote: Arc<dyn RemoteKeyBacking>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Install a software key pool
    pub fn with_pool(mut self, pool: Arc<SoftwareKeyPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The warm-key pool, for periodic refill
    pub fn pool(&self) -> &Arc<SoftwareKeyPool> {
        &self.pool
    }

    /// The auth instance this keystore belongs to
    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    fn remote_request(&self) -> RemoteKeyRequest {
        let (slot, keyring) = match &self.backing {
            KeyStoreBackingConfig::Software => (None, None),
            KeyStoreBackingConfig::Hsm { slot } => (Some(*slot), None),
            KeyStoreBackingConfig::Kms { keyring } => (None, Some(keyring.clone())),
        };
        RemoteKeyRequest {
            slot,
            host_id: self.host_id,
            keyring,
            common_name: self.cluster.clone(),
        }
    }

    fn remote(&self) -> Result<&Arc<dyn RemoteKeyBacking>> {
        self.remote.as_ref().ok_or_else(|| {
            AuthError::not_implemented(
                "the configured key backing is not available on this build",
            )
        })
    }

    /// Mint a fresh SSH keypair in the configured backing
    pub async fn new_ssh_key_pair(&self) -> Result<SshKeyPair> {
        match &self.backing {
            KeyStoreBackingConfig::Software => {
                let key = self.pool.take()?;
                let public_key = key.public_key().to_openssh()?;
                let pem = key.to_openssh(LineEnding::LF)?;
                debug!("generated software SSH CA key");
                Ok(SshKeyPair {
                    public_key,
                    private_key: KeyRef::Software {
                        private_key_pem: pem.to_string(),
                    },
                })
            }
            _ => {
                let (public_key, private_key) = self
                    .remote()?
                    .generate(RemoteKeyKind::Ssh, &self.remote_request())
                    .await?;
                info!("generated remote SSH CA key");
                Ok(SshKeyPair {
                    public_key,
                    private_key,
                })
            }
        }
    }

    /// Mint a fresh TLS CA keypair in the configured backing
    pub async fn new_tls_key_pair(&self, common_name: &str) -> Result<TlsKeyPair> {
        match &self.backing {
            KeyStoreBackingConfig::Software => {
                let key_pair = rcgen::KeyPair::generate()?;
                let cert_pem =
                    crate::tls::build_ca_cert(self.clock.as_ref(), common_name, &key_pair)?;
                debug!(common_name, "generated software TLS CA key");
                Ok(TlsKeyPair {
                    cert_pem,
                    key: KeyRef::Software {
                        private_key_pem: key_pair.serialize_pem(),
                    },
                })
            }
            _ => {
                let mut req = self.remote_request();
                req.common_name = common_name.to_string();
                let (cert_pem, key) = self.remote()?.generate(RemoteKeyKind::Tls, &req).await?;
                info!(common_name, "generated remote TLS CA key");
                Ok(TlsKeyPair { cert_pem, key })
            }
        }
    }

    /// Mint a fresh JWT keypair in the configured backing
    pub async fn new_jwt_key_pair(&self) -> Result<JwtKeyPair> {
        match &self.backing {
            KeyStoreBackingConfig::Software => {
                let key = self.pool.take()?;
                let public_key = key.public_key().to_openssh()?;
                Ok(JwtKeyPair {
                    public_key,
                    key: KeyRef::Software {
                        private_key_pem: key.to_openssh(LineEnding::LF)?.to_string(),
                    },
                })
            }
            _ => {
                let (public_key, key) = self
                    .remote()?
                    .generate(RemoteKeyKind::Jwt, &self.remote_request())
                    .await?;
                Ok(JwtKeyPair { public_key, key })
            }
        }
    }

    /// Mint a full key set of the right shape for a CA type
    pub async fn new_key_set(&self, kind: CertAuthType) -> Result<CaKeySet> {
        let mut set = CaKeySet::default();
        if kind.has_ssh_keys() {
            set.ssh.push(self.new_ssh_key_pair().await?);
        }
        if kind.has_tls_keys() {
            let common_name = self.cluster.clone();
            set.tls.push(self.new_tls_key_pair(&common_name).await?);
        }
        if kind.has_jwt_keys() {
            set.jwt.push(self.new_jwt_key_pair().await?);
        }
        Ok(set)
    }

    /// Whether this instance can produce a private-key operation for `key`
    pub fn usable(&self, key: &KeyRef) -> bool {
        match key {
            KeyRef::Software { .. } => true,
            KeyRef::Hsm { host_id, .. } => {
                self.remote.is_some()
                    && matches!(self.backing, KeyStoreBackingConfig::Hsm { .. })
                    && *host_id == self.host_id
            }
            KeyRef::Kms { resource } => {
                self.remote.is_some()
                    && match &self.backing {
                        KeyStoreBackingConfig::Kms { keyring } => resource.starts_with(keyring),
                        _ => false,
                    }
            }
        }
    }

    fn matches_backing(&self, key: &KeyRef) -> bool {
        matches!(
            (&self.backing, key.backing()),
            (KeyStoreBackingConfig::Software, BackingKind::Software)
                | (KeyStoreBackingConfig::Hsm { .. }, BackingKind::Hsm)
                | (KeyStoreBackingConfig::Kms { .. }, BackingKind::Kms)
        )
    }

    /// Pick the first usable key, preferring keys of the configured backing
    fn select<'a, T>(&self, pairs: &'a [T], key_of: impl Fn(&'a T) -> &'a KeyRef) -> Option<&'a T> {
        pairs
            .iter()
            .find(|p| self.matches_backing(key_of(p)) && self.usable(key_of(p)))
            .or_else(|| pairs.iter().find(|p| self.usable(key_of(p))))
    }

    async fn materialize_ssh(&self, key: &KeyRef) -> Result<PrivateKey> {
        match key {
            KeyRef::Software { private_key_pem } => Ok(PrivateKey::from_openssh(private_key_pem)?),
            _ => self.remote()?.ssh_signer(key).await,
        }
    }

    async fn materialize_tls(&self, key: &KeyRef) -> Result<rcgen::KeyPair> {
        match key {
            KeyRef::Software { private_key_pem } => Ok(rcgen::KeyPair::from_pem(private_key_pem)?),
            _ => self.remote()?.tls_signer(key).await,
        }
    }

    async fn materialize_jwt(&self, key: &KeyRef) -> Result<ed25519_dalek::SigningKey> {
        match key {
            KeyRef::Software { private_key_pem } => {
                let key = PrivateKey::from_openssh(private_key_pem)?;
                let pair = key.key_data().ed25519().ok_or_else(|| {
                    AuthError::bad_parameter("JWT signing requires an Ed25519 key")
                })?;
                Ok(ed25519_dalek::SigningKey::from_bytes(
                    &pair.private.to_bytes(),
                ))
            }
            _ => self.remote()?.jwt_signer(key).await,
        }
    }

    /// A usable SSH signer from the CA's active keys
    pub async fn ssh_signer(&self, ca: &CertAuthority) -> Result<PrivateKey> {
        let pair = self
            .select(&ca.active_keys.ssh, |p| &p.private_key)
            .ok_or_else(|| {
                AuthError::not_found(format!(
                    "no usable SSH key for {} CA on this auth instance",
                    ca.id.kind
                ))
            })?;
        self.materialize_ssh(&pair.private_key).await
    }

    /// A usable SSH signer from the CA's additional-trusted keys; used only
    /// while a freshly provisioned local key has not yet become active
    pub async fn additional_trusted_ssh_signer(&self, ca: &CertAuthority) -> Result<PrivateKey> {
        let pair = self
            .select(&ca.additional_trusted_keys.ssh, |p| &p.private_key)
            .ok_or_else(|| {
                AuthError::not_found(format!(
                    "no usable additional-trusted SSH key for {} CA on this auth instance",
                    ca.id.kind
                ))
            })?;
        self.materialize_ssh(&pair.private_key).await
    }

    /// A usable TLS certificate and signer from the CA's active keys
    pub async fn tls_cert_and_signer(&self, ca: &CertAuthority) -> Result<(String, rcgen::KeyPair)> {
        let pair = self
            .select(&ca.active_keys.tls, |p| &p.key)
            .ok_or_else(|| {
                AuthError::not_found(format!(
                    "no usable TLS key for {} CA on this auth instance",
                    ca.id.kind
                ))
            })?;
        let signer = self.materialize_tls(&pair.key).await?;
        Ok((pair.cert_pem.clone(), signer))
    }

    /// A usable TLS certificate and signer from the additional-trusted set
    pub async fn additional_trusted_tls_cert_and_signer(
        &self,
        ca: &CertAuthority,
    ) -> Result<(String, rcgen::KeyPair)> {
        let pair = self
            .select(&ca.additional_trusted_keys.tls, |p| &p.key)
            .ok_or_else(|| {
                AuthError::not_found(format!(
                    "no usable additional-trusted TLS key for {} CA on this auth instance",
                    ca.id.kind
                ))
            })?;
        let signer = self.materialize_tls(&pair.key).await?;
        Ok((pair.cert_pem.clone(), signer))
    }

    /// A usable JWT signer from the CA's active keys
    pub async fn jwt_signer(&self, ca: &CertAuthority) -> Result<ed25519_dalek::SigningKey> {
        let pair = self.select(&ca.active_keys.jwt, |p| &p.key).ok_or_else(|| {
            AuthError::not_found(format!(
                "no usable JWT key for {} CA on this auth instance",
                ca.id.kind
            ))
        })?;
        self.materialize_jwt(&pair.key).await
    }

    /// Whether any additional-trusted key is usable by this instance
    pub fn has_usable_additional_keys(&self, ca: &CertAuthority) -> bool {
        ca.additional_trusted_keys
            .key_refs()
            .iter()
            .any(|k| self.matches_backing(k) && self.usable(k))
    }

    /// Whether any active key is usable by this instance
    pub fn has_usable_active_keys(&self, ca: &CertAuthority) -> bool {
        ca.active_keys
            .key_refs()
            .iter()
            .any(|k| self.matches_backing(k) && self.usable(k))
    }

    /// Destroy every backing-resident key not present in `in_use`.
    ///
    /// Best-effort: failures are logged and swallowed. Software keys live
    /// inline in the CA record and need no collection. HSM keys created by
    /// other auth instances are left alone.
    pub async fn delete_unused_keys(&self, in_use: &[KeyRef]) {
        let remote = match &self.remote {
            Some(remote) => remote,
            None => return,
        };

        let candidates = match remote.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate backing keys; skipping key GC");
                return;
            }
        };

        for key in candidates {
            if let KeyRef::Hsm { host_id, .. } = &key {
                if *host_id != self.host_id {
                    continue;
                }
            }
            if in_use.contains(&key) {
                continue;
            }
            if let Err(e) = remote.delete_key(&key).await {
                warn!(error = %e, "failed to delete unused backing key");
            } else {
                info!("deleted unused backing key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaId;
    use crate::clock::ManualClock;

    fn keystore(backing: KeyStoreBackingConfig) -> KeyStore {
        KeyStore::new(
            "example.com",
            Uuid::new_v4(),
            backing,
            Arc::new(ManualClock::default()),
        )
    }

    #[tokio::test]
    async fn test_software_ssh_key_round_trip() {
        let store = keystore(KeyStoreBackingConfig::Software);
        let pair = store.new_ssh_key_pair().await.unwrap();
        assert!(pair.public_key.starts_with("ssh-ed25519 "));

        let ca = CertAuthority::new(CaId::new(CertAuthType::Host, "example.com"), {
            let mut set = CaKeySet::default();
            set.ssh.push(pair);
            set
        });
        let signer = store.ssh_signer(&ca).await.unwrap();
        assert_eq!(
            signer.public_key().to_openssh().unwrap(),
            ca.active_keys.ssh[0].public_key
        );
    }

    #[tokio::test]
    async fn test_hsm_backing_absent_is_not_implemented() {
        let store = keystore(KeyStoreBackingConfig::Hsm { slot: 0 });
        let err = store.new_ssh_key_pair().await.unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[tokio::test]
    async fn test_foreign_hsm_key_is_not_usable() {
        let store = keystore(KeyStoreBackingConfig::Software);
        let foreign = KeyRef::Hsm {
            slot: 0,
            label: "ca".to_string(),
            host_id: Uuid::new_v4(),
        };
        assert!(!store.usable(&foreign));

        let ca = CertAuthority::new(CaId::new(CertAuthType::Host, "example.com"), {
            let mut set = CaKeySet::default();
            set.ssh.push(SshKeyPair {
                public_key: "ssh-ed25519 AAAA".to_string(),
                private_key: foreign,
            });
            set
        });
        let err = store.ssh_signer(&ca).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_key_set_shape_follows_ca_type() {
        let store = keystore(KeyStoreBackingConfig::Software);

        let set = store.new_key_set(CertAuthType::User).await.unwrap();
        assert!(!set.ssh.is_empty() && !set.tls.is_empty() && set.jwt.is_empty());

        let set = store.new_key_set(CertAuthType::Jwt).await.unwrap();
        assert!(set.ssh.is_empty() && set.tls.is_empty() && !set.jwt.is_empty());

        let set = store.new_key_set(CertAuthType::OpenSsh).await.unwrap();
        assert!(!set.ssh.is_empty() && set.tls.is_empty());
    }

    #[test]
    fn test_pool_refill() {
        let pool = SoftwareKeyPool::new(2);
        assert!(pool.is_empty());
        pool.refill().unwrap();
        assert_eq!(pool.len(), 2);
        pool.take().unwrap();
        assert_eq!(pool.len(), 1);
    }
}
