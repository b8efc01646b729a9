//! Certificate issuance pipeline
//!
//! The hub of the authority: normalizes a [`CertRequest`], consults locks,
//! clamps TTLs, verifies hardware-key attestation, routes across clusters,
//! and mints the joint SSH + TLS bundle, emitting an audit event with the
//! final identity snapshot. Signer operations round-trip to HSM/KMS
//! backings, so no lock is held across them: every piece of shared state is
//! read before signing begins.

use crate::ca::{CaCache, CaId};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::events::{AuditEmitter, AuditEvent};
use crate::identity::{DeviceExtensions, Identity, RouteToDatabase};
use crate::jwt;
use crate::keystore::KeyStore;
use crate::lock::{LockTarget, LockWatcher};
use crate::roles::{RoleSet, User};
use crate::ssh;
use crate::tls;
use crate::types::{
    host_fqdn, CertAuthType, CertificateFormat, PrivateKeyPolicy, JOIN_ONLY_PRINCIPAL,
};
use crate::{backend, AuthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ssh_key::PublicKey;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// An opaque hardware-key attestation statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationStatement {
    /// The public key the statement attests, OpenSSH format
    pub public_key: String,
    /// Raw attestation payload, verified by the capability
    pub data: Vec<u8>,
}

/// Capability verifying hardware-key attestation statements.
///
/// Swappable at startup; the default allows only a `None` private-key
/// policy, so clusters without the capability reject any policy that
/// demands hardware keys.
#[async_trait]
pub trait Attestor: Send + Sync {
    /// Verify a statement for `public_key`, returning the policy the key
    /// satisfies
    async fn verify(
        &self,
        statement: &AttestationStatement,
        public_key: &str,
    ) -> Result<PrivateKeyPolicy>;
}

/// The default attestor: no hardware attestation available
#[derive(Debug, Default)]
pub struct NoAttestation;

#[async_trait]
impl Attestor for NoAttestation {
    async fn verify(
        &self,
        _statement: &AttestationStatement,
        _public_key: &str,
    ) -> Result<PrivateKeyPolicy> {
        Err(AuthError::access_denied(
            "hardware key attestation is not supported on this cluster",
        ))
    }
}

/// Non-blocking token bucket; the host-certificate throttle
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// A bucket holding `capacity` tokens refilled at `refill_per_sec`
    pub fn new(capacity: f64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new((capacity, now)),
            clock,
        }
    }

    /// Take one token; `LimitExceeded` when the bucket is dry
    pub fn try_acquire(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let elapsed = (now - state.1).num_milliseconds().max(0) as f64 / 1000.0;
        state.0 = (state.0 + elapsed * self.refill_per_sec).min(self.capacity);
        state.1 = now;
        if state.0 < 1.0 {
            return Err(AuthError::limit_exceeded(
                "host certificate generation rate exceeded",
            ));
        }
        state.0 -= 1.0;
        Ok(())
    }
}

/// A trust relationship with a remote cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCluster {
    /// Remote cluster name
    pub name: String,
    /// Local roles allowed to route to it
    pub authorized_roles: Vec<String>,
}

fn remote_cluster_key(name: &str) -> String {
    format!("remoteclusters/{name}")
}

/// The normalized input to issuance
#[derive(Debug, Clone)]
pub struct CertRequest {
    /// User the certificates are for
    pub user: User,
    /// Roles in effect for this request
    pub roles: RoleSet,
    /// SSH public key to certify, OpenSSH format
    pub ssh_public_key: String,
    /// TLS public key to certify, SPKI PEM; absent skips the TLS leaf
    pub tls_public_key_pem: Option<String>,
    /// Requested TTL, clamped by the role set unless overridden
    pub ttl: Duration,
    /// Admin-tool path: use the requested TTL and skip the login TTL cap
    pub override_role_ttl: bool,
    /// Certificate format; `None` takes the role set default
    pub cert_format: Option<CertificateFormat>,
    /// Remote cluster to route to
    pub route_to_cluster: Option<String>,
    /// Kubernetes cluster to route to
    pub kubernetes_cluster: Option<String>,
    /// Database to route to
    pub route_to_database: Option<RouteToDatabase>,
    /// Application to route to
    pub route_to_app: Option<String>,
    /// MFA device that verified this request
    pub mfa_verified: Option<String>,
    /// Trusted device the request came from, for lock targeting
    pub trusted_device_id: Option<String>,
    /// Device-trust attributes to bind
    pub device_extensions: Option<DeviceExtensions>,
    /// Approved access requests consumed by this certificate
    pub active_requests: Vec<String>,
    /// Resource IDs narrowing the certificate; enterprise-only
    pub allowed_resource_ids: Vec<String>,
    /// Renewable (bot) certificate
    pub renewable: bool,
    /// Renewal generation counter
    pub generation: u64,
    /// Attestation statement for the public key
    pub attestation: Option<AttestationStatement>,
    /// Request opts into IP pinning
    pub pin_ip: bool,
    /// Stamp the issued identity as non-reissuable
    pub disallow_reissue: bool,
    /// Identity of the caller when reissuing from an existing certificate
    pub prev_identity: Option<Identity>,
    /// Observed client IP
    pub client_ip: Option<String>,
    /// Impersonating user
    pub impersonator: Option<String>,
    /// Include the host CA chain in the response
    pub include_host_ca: bool,
}

impl CertRequest {
    /// A minimal request for `user` with `roles`
    pub fn new(user: User, roles: RoleSet, ssh_public_key: String, ttl: Duration) -> Self {
        Self {
            user,
            roles,
            ssh_public_key,
            tls_public_key_pem: None,
            ttl,
            override_role_ttl: false,
            cert_format: None,
            route_to_cluster: None,
            kubernetes_cluster: None,
            route_to_database: None,
            route_to_app: None,
            mfa_verified: None,
            trusted_device_id: None,
            device_extensions: None,
            active_requests: Vec::new(),
            allowed_resource_ids: Vec::new(),
            renewable: false,
            generation: 0,
            attestation: None,
            pin_ip: false,
            disallow_reissue: false,
            prev_identity: None,
            client_ip: None,
            impersonator: None,
            include_host_ca: false,
        }
    }
}

/// The issued bundle
#[derive(Debug, Clone)]
pub struct Certs {
    /// SSH certificate, OpenSSH format
    pub ssh: String,
    /// TLS leaf, PEM; absent on the OpenSSH CA path
    pub tls: Option<String>,
    /// Trusted TLS CA certificates, PEM
    pub tls_ca_certs: Vec<String>,
    /// Trusted SSH CA public keys, authorized-keys format
    pub ssh_ca_certs: Vec<String>,
}

/// Parameters for host certificate issuance
#[derive(Debug, Clone)]
pub struct HostCertRequest {
    /// Host UUID
    pub host_id: Uuid,
    /// Node name and additional principals
    pub principals: Vec<String>,
    /// System role of the host
    pub role: String,
    /// SSH public key to certify
    pub ssh_public_key: String,
    /// Certificate lifetime; zero means no expiry
    pub ttl: Duration,
}

/// Parameters for database server certificate issuance
#[derive(Debug, Clone)]
pub struct DatabaseCertRequest {
    /// Database server name, becomes the subject CN and a SAN
    pub server_name: String,
    /// Additional SANs
    pub server_names: Vec<String>,
    /// Subject public key, SPKI PEM
    pub subject_public_key_pem: String,
    /// Certificate lifetime
    pub ttl: Duration,
}

/// Parameters for JWT issuance
#[derive(Debug, Clone)]
pub struct JwtRequest {
    /// Authenticated username
    pub username: String,
    /// Application URI the token is scoped to
    pub audience: String,
    /// Token lifetime
    pub ttl: Duration,
    /// Role names to embed
    pub roles: Vec<String>,
    /// Traits to embed
    pub traits: BTreeMap<String, Vec<String>>,
}

/// Parameters for augmenting an authenticated session with device trust
#[derive(Debug, Clone)]
pub struct AugmentRequest {
    /// Identity decoded from the caller's current TLS certificate
    pub identity: Identity,
    /// The caller's current SSH certificate, OpenSSH format
    pub ssh_cert: String,
    /// The caller's TLS public key, SPKI PEM
    pub tls_public_key_pem: String,
    /// Device-trust attributes to bind
    pub device_extensions: DeviceExtensions,
}

/// The issuance pipeline
pub struct CertificateService {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    cas: Arc<CaCache>,
    keystore: Arc<KeyStore>,
    locks: Arc<LockWatcher>,
    emitter: Arc<dyn AuditEmitter>,
    attestor: Arc<dyn Attestor>,
    backend: Arc<dyn backend::Backend>,
    host_cert_limiter: TokenBucket,
}

impl CertificateService {
    /// Assemble the pipeline
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AuthConfig,
        clock: Arc<dyn Clock>,
        cas: Arc<CaCache>,
        keystore: Arc<KeyStore>,
        locks: Arc<LockWatcher>,
        emitter: Arc<dyn AuditEmitter>,
        attestor: Arc<dyn Attestor>,
        backend: Arc<dyn backend::Backend>,
    ) -> Self {
        let host_cert_limiter = TokenBucket::new(20.0, 2.0, clock.clone());
        Self {
            config,
            clock,
            cas,
            keystore,
            locks,
            emitter,
            attestor,
            backend,
            host_cert_limiter,
        }
    }

    /// The cluster this authority serves
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// Record a trust relationship with a remote cluster
    pub async fn upsert_remote_cluster(&self, remote: RemoteCluster) -> Result<()> {
        let item = backend::marshal_item(remote_cluster_key(&remote.name), &remote)?;
        self.backend.put(item).await?;
        Ok(())
    }

    async fn check_remote_cluster_access(&self, req: &CertRequest, cluster: &str) -> Result<()> {
        let masked = || {
            AuthError::not_found(format!("remote cluster {cluster:?} is not found"))
        };

        let item = self
            .backend
            .get(&remote_cluster_key(cluster))
            .await
            .map_err(|e| if e.is_not_found() { masked() } else { e })?;
        let remote: RemoteCluster = backend::unmarshal_item(&item)?;

        let allowed = req
            .roles
            .role_names()
            .iter()
            .any(|r| remote.authorized_roles.contains(r));
        if !allowed {
            // Access denial is masked so callers cannot enumerate trust
            // relationships they are not part of
            debug!(cluster, user = %req.user.name, "remote cluster access denied; masking as not-found");
            return Err(masked());
        }
        Ok(())
    }

    fn lock_targets(&self, req: &CertRequest) -> Vec<LockTarget> {
        let mut targets = vec![LockTarget::User(req.user.name.clone())];
        if let Some(device) = &req.mfa_verified {
            targets.push(LockTarget::MfaDevice(device.clone()));
        }
        if let Some(device) = &req.trusted_device_id {
            targets.push(LockTarget::TrustedDevice(device.clone()));
        }
        targets.extend(req.roles.role_names().into_iter().map(LockTarget::Role));
        targets.extend(
            req.active_requests
                .iter()
                .cloned()
                .map(LockTarget::AccessRequest),
        );
        targets
    }

    /// Generate the joint SSH + TLS user certificate bundle
    pub async fn generate_user_certs(&self, req: CertRequest) -> Result<Certs> {
        self.user_certs_from_ca(req, CertAuthType::User).await
    }

    /// Generate an SSH-only certificate from the OpenSSH CA, for
    /// registered plain OpenSSH servers
    pub async fn generate_open_ssh_cert(&self, mut req: CertRequest) -> Result<Certs> {
        req.tls_public_key_pem = None;
        self.user_certs_from_ca(req, CertAuthType::OpenSsh).await
    }

    async fn user_certs_from_ca(&self, req: CertRequest, ca_type: CertAuthType) -> Result<Certs> {
        // Validation
        if req.user.name.is_empty() {
            return Err(AuthError::bad_parameter("certificate request is missing a user"));
        }
        if req.ssh_public_key.is_empty() {
            return Err(AuthError::bad_parameter(
                "certificate request is missing an SSH public key",
            ));
        }
        if let Some(db) = &req.route_to_database {
            if db.protocol.eq_ignore_ascii_case("mongodb") && db.username.is_empty() {
                return Err(AuthError::bad_parameter(
                    "MongoDB routing requires a database user",
                ));
            }
        }
        if !req.allowed_resource_ids.is_empty() && !self.config.enterprise {
            return Err(AuthError::not_implemented(
                "resource-scoped certificates require an enterprise build",
            ));
        }
        if let Some(prev) = &req.prev_identity {
            if prev.disallow_reissue {
                return Err(AuthError::access_denied(
                    "certificate re-issue is disallowed for this session",
                ));
            }
        }

        // Lock check, once, with the role set's effective mode
        let mode = req.roles.locking_mode(Default::default());
        self.locks.check_lock_in_force(mode, &self.lock_targets(&req))?;

        // Certificate format
        let cert_format = req.cert_format.unwrap_or_else(|| req.roles.cert_format());

        // TTL clamping and allowed logins
        let (session_ttl, allowed_logins) = if req.override_role_ttl {
            (req.ttl, req.roles.checked_logins(Duration::ZERO))
        } else {
            let ttl = req.roles.adjust_session_ttl(req.ttl);
            (ttl, req.roles.checked_logins(ttl))
        };

        // Attestation: strictest of cluster and role policies wins
        let required_policy = req.roles.private_key_policy(self.config.private_key_policy);
        let attested_policy = if required_policy != PrivateKeyPolicy::None {
            let statement = req.attestation.as_ref().ok_or_else(|| {
                AuthError::access_denied(format!(
                    "private key policy {:?} requires a hardware key attestation",
                    required_policy.as_str()
                ))
            })?;
            let attested = self
                .attestor
                .verify(statement, &req.ssh_public_key)
                .await
                .map_err(|e| AuthError::access_denied(format!("attestation failed: {e}")))?;
            if !required_policy.is_satisfied_by(attested) {
                return Err(AuthError::access_denied(format!(
                    "attested policy {:?} does not satisfy required policy {:?}",
                    attested.as_str(),
                    required_policy.as_str()
                )));
            }
            attested
        } else {
            PrivateKeyPolicy::None
        };

        // Join-only principal, always present
        let mut principals = allowed_logins;
        principals.push(JOIN_ONLY_PRINCIPAL.to_string());

        // Cross-cluster routing
        if let Some(cluster) = &req.route_to_cluster {
            if cluster != &self.config.cluster_name {
                self.check_remote_cluster_access(&req, cluster).await?;
            }
        }

        // IP pinning
        let pin = req.pin_ip || req.roles.pin_source_ip() || self.config.pin_source_ip;
        let pinned_ip = if pin {
            match req.client_ip.clone() {
                Some(ip) => Some(ip),
                None => {
                    return Err(AuthError::bad_parameter(
                        "IP pinning is required but the client IP is unknown",
                    ));
                }
            }
        } else {
            None
        };

        // Read every shared structure before signing: signer calls may
        // round-trip to an HSM or KMS
        let ca = self.cas.get(&CaId::new(ca_type, &self.config.cluster_name)).await?;
        let ssh_signer = self.keystore.ssh_signer(&ca).await?;
        let public_key = PublicKey::from_openssh(&req.ssh_public_key)?;

        let allowed_resource_ids = if req.allowed_resource_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&req.allowed_resource_ids)?)
        };

        let ssh_cert = ssh::generate_user_cert(
            self.clock.as_ref(),
            &ssh::UserCertParams {
                ca_signer: ssh_signer,
                public_key,
                username: req.user.name.clone(),
                principals: principals.clone(),
                roles: req.roles.role_names(),
                ttl: session_ttl,
                cert_format,
                mfa_verified: req.mfa_verified.clone(),
                impersonator: req.impersonator.clone(),
                device_id: req.device_extensions.as_ref().map(|d| d.device_id.clone()),
                device_asset_tag: req.device_extensions.as_ref().map(|d| d.asset_tag.clone()),
                device_credential_id: req
                    .device_extensions
                    .as_ref()
                    .map(|d| d.credential_id.clone()),
                allowed_resource_ids,
                disallow_reissue: req.disallow_reissue,
                renewable: req.renewable,
                generation: req.generation,
                source_ip: pinned_ip.clone(),
                previous_identity_expires: req
                    .prev_identity
                    .as_ref()
                    .and_then(|p| p.previous_identity_expires),
                private_key_policy: attested_policy,
            },
        )?;

        let identity = Identity {
            username: req.user.name.clone(),
            impersonator: req.impersonator.clone(),
            principals,
            roles: req.roles.role_names(),
            traits: req.user.traits.clone(),
            route_to_cluster: req.route_to_cluster.clone(),
            kubernetes_cluster: req.kubernetes_cluster.clone(),
            route_to_database: req.route_to_database.clone(),
            route_to_app: req.route_to_app.clone(),
            mfa_verified: req.mfa_verified.clone(),
            previous_identity_expires: req
                .prev_identity
                .as_ref()
                .and_then(|p| p.previous_identity_expires),
            login_ip: req.client_ip.clone(),
            pinned_ip,
            active_requests: req.active_requests.clone(),
            private_key_policy: attested_policy,
            device_extensions: req.device_extensions.clone(),
            user_type: req.user.user_type,
            disallow_reissue: req.disallow_reissue,
        };

        // The OpenSSH CA never produces a TLS certificate
        let tls_cert = if ca_type == CertAuthType::User {
            match &req.tls_public_key_pem {
                Some(spki) => {
                    let (ca_cert_pem, tls_signer) = self.keystore.tls_cert_and_signer(&ca).await?;
                    Some(tls::generate_certificate(
                        self.clock.as_ref(),
                        &ca_cert_pem,
                        tls_signer,
                        &tls::CertificateRequest {
                            identity: identity.clone(),
                            subject_public_key_pem: spki.clone(),
                            not_after: self.clock.now()
                                + chrono::Duration::from_std(session_ttl).unwrap_or_else(|_| chrono::Duration::zero()),
                            dns_names: Vec::new(),
                        },
                    )?)
                }
                None => None,
            }
        } else {
            None
        };

        let _ = self
            .emitter
            .emit(AuditEvent::CertificateIssued {
                cert_kind: "user".to_string(),
                identity,
            })
            .await;
        info!(user = %req.user.name, ca = %ca_type, ttl_secs = session_ttl.as_secs(), "issued user certificates");

        // Chain: the signing CA's public material, plus the host CA chain
        // when the caller asked for it
        let mut tls_ca_certs = ca.trusted_tls_certs();
        let mut ssh_ca_certs = ca.trusted_ssh_public_keys();
        if req.include_host_ca {
            let host_ca = self
                .cas
                .get(&CaId::new(CertAuthType::Host, &self.config.cluster_name))
                .await?;
            tls_ca_certs.extend(host_ca.trusted_tls_certs());
            ssh_ca_certs.extend(host_ca.trusted_ssh_public_keys());
        }

        Ok(Certs {
            ssh: ssh_cert.to_openssh()?,
            tls: tls_cert,
            tls_ca_certs,
            ssh_ca_certs,
        })
    }

    /// Generate a host certificate, rate-limited by a token bucket
    pub async fn generate_host_cert(&self, req: HostCertRequest) -> Result<String> {
        self.host_cert_limiter.try_acquire()?;

        if req.role.is_empty() {
            return Err(AuthError::bad_parameter(
                "host certificate request is missing a system role",
            ));
        }

        let ca = self
            .cas
            .get(&CaId::new(CertAuthType::Host, &self.config.cluster_name))
            .await?;
        let signer = self.keystore.ssh_signer(&ca).await?;
        let public_key = PublicKey::from_openssh(&req.ssh_public_key)?;

        let cert = ssh::generate_host_cert(
            self.clock.as_ref(),
            &ssh::HostCertParams {
                ca_signer: signer,
                public_key,
                host_id: host_fqdn(req.host_id, &self.config.cluster_name),
                principals: req.principals.clone(),
                role: req.role.clone(),
                cluster_name: self.config.cluster_name.clone(),
                ttl: req.ttl,
            },
        )?;

        let _ = self
            .emitter
            .emit(AuditEvent::CertificateIssued {
                cert_kind: "host".to_string(),
                identity: Identity {
                    username: host_fqdn(req.host_id, &self.config.cluster_name),
                    roles: vec![req.role],
                    ..Default::default()
                },
            })
            .await;

        Ok(cert.to_openssh()?)
    }

    /// Generate a TLS certificate for a database server from the database CA
    pub async fn generate_database_cert(&self, req: DatabaseCertRequest) -> Result<Certs> {
        if req.server_name.is_empty() {
            return Err(AuthError::bad_parameter(
                "database certificate request is missing a server name",
            ));
        }

        let ca = self
            .cas
            .get(&CaId::new(CertAuthType::Database, &self.config.cluster_name))
            .await?;
        let (ca_cert_pem, signer) = self.keystore.tls_cert_and_signer(&ca).await?;

        let mut dns_names = vec![req.server_name.clone()];
        for name in &req.server_names {
            if !dns_names.contains(name) {
                dns_names.push(name.clone());
            }
        }

        let identity = Identity {
            username: req.server_name.clone(),
            ..Default::default()
        };
        let pem = tls::generate_certificate(
            self.clock.as_ref(),
            &ca_cert_pem,
            signer,
            &tls::CertificateRequest {
                identity,
                subject_public_key_pem: req.subject_public_key_pem.clone(),
                not_after: self.clock.now()
                    + chrono::Duration::from_std(req.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
                dns_names,
            },
        )?;

        Ok(Certs {
            ssh: String::new(),
            tls: Some(pem),
            tls_ca_certs: ca.trusted_tls_certs(),
            ssh_ca_certs: Vec::new(),
        })
    }

    /// Sign a JWT from the JWT CA
    pub async fn generate_jwt(&self, req: JwtRequest) -> Result<String> {
        let ca = self
            .cas
            .get(&CaId::new(CertAuthType::Jwt, &self.config.cluster_name))
            .await?;
        let signer = self.keystore.jwt_signer(&ca).await?;
        jwt::sign(
            self.clock.as_ref(),
            &signer,
            jwt::SignParams {
                username: req.username,
                cluster: self.config.cluster_name.clone(),
                audience: req.audience,
                ttl: chrono::Duration::from_std(req.ttl)
                    .map_err(|_| AuthError::bad_parameter("JWT TTL out of range"))?,
                roles: req.roles,
                traits: req.traits,
            },
        )
    }

    /// Sign an empty CRL from the database CA
    pub async fn generate_crl(&self) -> Result<String> {
        let ca = self
            .cas
            .get(&CaId::new(CertAuthType::Database, &self.config.cluster_name))
            .await?;
        let (ca_cert_pem, signer) = self.keystore.tls_cert_and_signer(&ca).await?;
        tls::generate_crl(self.clock.as_ref(), &ca_cert_pem, signer, &[])
    }

    /// Add device-trust extensions to an already-authenticated session's
    /// certificates without re-running role logic. The augmented
    /// certificates keep the original expiry.
    pub async fn augment_user_certs(&self, req: AugmentRequest) -> Result<Certs> {
        if req.device_extensions.is_empty() {
            return Err(AuthError::bad_parameter(
                "augmentation requires at least one device extension",
            ));
        }
        if req.identity.disallow_reissue {
            return Err(AuthError::access_denied(
                "certificate re-issue is disallowed for this session",
            ));
        }
        if req.identity.device_extensions.is_some() {
            return Err(AuthError::bad_parameter(
                "certificates are already augmented with device extensions",
            ));
        }

        let existing = ssh_key::Certificate::from_openssh(&req.ssh_cert)?;
        let now = self.clock.now().timestamp().max(0) as u64;
        if existing.valid_before() <= now {
            return Err(AuthError::access_denied("certificate is expired"));
        }
        let remaining = Duration::from_secs(existing.valid_before() - now);

        let ca = self
            .cas
            .get(&CaId::new(CertAuthType::User, &self.config.cluster_name))
            .await?;
        let ssh_signer = self.keystore.ssh_signer(&ca).await?;

        let mut identity = req.identity.clone();
        identity.device_extensions = Some(req.device_extensions.clone());

        let ssh_cert = ssh::generate_user_cert(
            self.clock.as_ref(),
            &ssh::UserCertParams {
                ca_signer: ssh_signer,
                public_key: ssh_key::PublicKey::from(existing.public_key().clone()),
                username: identity.username.clone(),
                principals: existing.valid_principals().to_vec(),
                roles: identity.roles.clone(),
                ttl: remaining,
                cert_format: CertificateFormat::Standard,
                mfa_verified: identity.mfa_verified.clone(),
                impersonator: identity.impersonator.clone(),
                device_id: Some(req.device_extensions.device_id.clone()),
                device_asset_tag: Some(req.device_extensions.asset_tag.clone()),
                device_credential_id: Some(req.device_extensions.credential_id.clone()),
                allowed_resource_ids: None,
                disallow_reissue: identity.disallow_reissue,
                renewable: false,
                generation: 0,
                source_ip: identity.pinned_ip.clone(),
                previous_identity_expires: identity.previous_identity_expires,
                private_key_policy: identity.private_key_policy,
            },
        )?;

        let (ca_cert_pem, tls_signer) = self.keystore.tls_cert_and_signer(&ca).await?;
        let tls_cert = tls::generate_certificate(
            self.clock.as_ref(),
            &ca_cert_pem,
            tls_signer,
            &tls::CertificateRequest {
                identity: identity.clone(),
                subject_public_key_pem: req.tls_public_key_pem.clone(),
                not_after: self.clock.now()
                    + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()),
                dns_names: Vec::new(),
            },
        )?;

        let _ = self
            .emitter
            .emit(AuditEvent::CertificateIssued {
                cert_kind: "user".to_string(),
                identity,
            })
            .await;

        Ok(Certs {
            ssh: ssh_cert.to_openssh()?,
            tls: Some(tls_cert),
            tls_ca_certs: ca.trusted_tls_certs(),
            ssh_ca_certs: ca.trusted_ssh_public_keys(),
        })
    }
}
