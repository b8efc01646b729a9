//! Web sessions
//!
//! Issues and renews browser sessions: a fresh keypair, certificates from
//! the issuance pipeline, and opaque session and bearer tokens. Session
//! extension supports three mutually exclusive derivations — trait reload,
//! access-request elevation, and switchback — all preserving the original
//! login time.

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::events::{AuditEmitter, AuditEvent};
use crate::issuance::{CertRequest, CertificateService};
use crate::roles::{RoleStore, User, UserStore};
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// An approved elevation of a user's access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Request ID
    pub id: String,
    /// Requesting user
    pub user: String,
    /// Roles granted on approval
    pub roles: Vec<String>,
    /// Specific resources the request narrows access to; empty means
    /// role-wide access
    pub resource_ids: Vec<String>,
    /// Whether the request was approved
    pub approved: bool,
    /// When the elevated access expires
    pub access_expiry: DateTime<Utc>,
}

fn access_request_key(id: &str) -> String {
    format!("access_requests/{id}")
}

/// A stored web session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSession {
    /// Owning user
    pub user: String,
    /// Opaque session ID
    pub session_id: String,
    /// Opaque bearer token, indexed separately
    pub bearer_token: String,
    /// SSH private key for the session, OpenSSH PEM
    pub ssh_private_key_pem: String,
    /// TLS private key for the session, PKCS#8 PEM
    pub tls_private_key_pem: String,
    /// SSH certificate, OpenSSH format
    pub ssh_cert: String,
    /// TLS certificate, PEM
    pub tls_cert: String,
    /// Session expiry
    pub expires: DateTime<Utc>,
    /// Bearer token expiry; never past `expires`
    pub bearer_expires: DateTime<Utc>,
    /// When the user first logged in; preserved across extensions
    pub login_time: DateTime<Utc>,
    /// Idle timeout; zero disables
    pub idle_timeout: Duration,
    /// Role names in effect
    pub roles: Vec<String>,
    /// Access request consumed by this session, if any
    pub consumed_access_request_id: Option<String>,
    /// Resource IDs the session is narrowed to
    pub resource_ids: Vec<String>,
}

/// Bearer token index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebToken {
    /// The bearer token
    pub token: String,
    /// Owning user
    pub user: String,
    /// Session the token belongs to
    pub session_id: String,
    /// Token expiry
    pub expires: DateTime<Utc>,
}

impl WebSession {
    /// The session's SSH private key, wrapped so it never lands in logs
    pub fn ssh_private_key(&self) -> crate::types::SecretString {
        crate::types::SecretString::new(self.ssh_private_key_pem.clone())
    }

    /// The session's TLS private key, wrapped so it never lands in logs
    pub fn tls_private_key(&self) -> crate::types::SecretString {
        crate::types::SecretString::new(self.tls_private_key_pem.clone())
    }
}

fn session_key(id: &str) -> String {
    format!("web/sessions/{id}")
}

fn token_key(token: &str) -> String {
    format!("web/tokens/{token}")
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Request for a fresh web session
#[derive(Debug, Clone)]
pub struct NewWebSessionRequest {
    /// Authenticated user
    pub user: User,
    /// Requested session TTL, clamped by the role set
    pub ttl: Duration,
    /// Observed client IP
    pub client_ip: Option<String>,
    /// MFA device that verified the login
    pub mfa_verified: Option<String>,
    /// Access requests already consumed at login
    pub access_requests: Vec<String>,
}

/// How an existing session is extended
#[derive(Debug, Clone)]
pub enum ExtendMode {
    /// Refresh traits from the user record, bypassing caches
    Reload,
    /// Merge an approved access request's roles into the session
    AccessRequest {
        /// Request to consume
        request_id: String,
    },
    /// Drop elevated roles and return to the user's static role set
    Switchback,
}

/// Request to derive a new session from an existing one
#[derive(Debug, Clone)]
pub struct ExtendWebSessionRequest {
    /// Owning user
    pub user: String,
    /// Session to extend
    pub prev_session_id: String,
    /// The one modification to apply
    pub mode: ExtendMode,
}

/// The session manager
pub struct SessionManager {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn AuditEmitter>,
    issuance: Arc<CertificateService>,
    users: UserStore,
    roles: RoleStore,
    config: SessionConfig,
}

impl SessionManager {
    /// Assemble the manager
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        emitter: Arc<dyn AuditEmitter>,
        issuance: Arc<CertificateService>,
        users: UserStore,
        roles: RoleStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            emitter,
            issuance,
            users,
            roles,
            config,
        }
    }

    /// Record an access request; consumed by session elevation
    pub async fn upsert_access_request(&self, request: &AccessRequest) -> Result<()> {
        let item = marshal_item(access_request_key(&request.id), request)?;
        self.backend.put(item).await?;
        Ok(())
    }

    async fn get_access_request(&self, id: &str) -> Result<AccessRequest> {
        let item = self.backend.get(&access_request_key(id)).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::not_found(format!("access request {id:?} is not found"))
            } else {
                e
            }
        })?;
        unmarshal_item(&item)
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_session(
        &self,
        user: &User,
        role_names: &[String],
        ttl: Duration,
        login_time: DateTime<Utc>,
        client_ip: Option<String>,
        mfa_verified: Option<String>,
        active_requests: Vec<String>,
        consumed_access_request_id: Option<String>,
        resource_ids: Vec<String>,
    ) -> Result<WebSession> {
        let roles = self.roles.resolve(role_names).await?;

        let ssh_key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)?;
        let tls_key = rcgen::KeyPair::generate()?;

        let mut req = CertRequest::new(
            user.clone(),
            roles,
            ssh_key.public_key().to_openssh()?,
            ttl,
        );
        req.tls_public_key_pem = Some(tls_key.public_key_pem());
        req.client_ip = client_ip;
        req.mfa_verified = mfa_verified;
        req.active_requests = active_requests;
        // Certificates that consume an access request cannot be used to
        // request further certificates
        req.disallow_reissue = !req.active_requests.is_empty();

        let certs = self.issuance.generate_user_certs(req).await?;
        let tls_cert = certs.tls.ok_or_else(|| {
            AuthError::bad_parameter("session issuance produced no TLS certificate")
        })?;

        let now = self.clock.now();
        let session_ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| AuthError::bad_parameter("session TTL out of range"))?;
        let bearer_ttl = chrono::Duration::from_std(ttl.min(self.config.max_bearer_ttl))
            .map_err(|_| AuthError::bad_parameter("bearer TTL out of range"))?;

        let session = WebSession {
            user: user.name.clone(),
            session_id: random_token(),
            bearer_token: random_token(),
            ssh_private_key_pem: ssh_key.to_openssh(LineEnding::LF)?.to_string(),
            tls_private_key_pem: tls_key.serialize_pem(),
            ssh_cert: certs.ssh,
            tls_cert,
            expires: now + session_ttl,
            bearer_expires: now + bearer_ttl,
            login_time,
            idle_timeout: self.config.idle_timeout,
            roles: role_names.to_vec(),
            consumed_access_request_id,
            resource_ids,
        };

        let item =
            marshal_item(session_key(&session.session_id), &session)?.with_expiry(session.expires);
        self.backend.put(item).await?;

        let token = WebToken {
            token: session.bearer_token.clone(),
            user: session.user.clone(),
            session_id: session.session_id.clone(),
            expires: session.bearer_expires,
        };
        let item = marshal_item(token_key(&token.token), &token)?.with_expiry(token.expires);
        self.backend.put(item).await?;

        Ok(session)
    }

    /// Create a fresh web session for an authenticated user
    pub async fn new_web_session(&self, req: NewWebSessionRequest) -> Result<WebSession> {
        let role_set = self.roles.resolve(&req.user.roles).await?;
        let ttl = role_set.adjust_session_ttl(req.ttl);
        let now = self.clock.now();

        let session = self
            .issue_session(
                &req.user,
                &req.user.roles.clone(),
                ttl,
                now,
                req.client_ip,
                req.mfa_verified,
                req.access_requests,
                None,
                Vec::new(),
            )
            .await?;

        info!(user = %session.user, session = %session.session_id, "web session created");
        let _ = self
            .emitter
            .emit(AuditEvent::SessionCreated {
                user: session.user.clone(),
                session_id: session.session_id.clone(),
            })
            .await;

        Ok(session)
    }

    /// Derive a new session from an existing one.
    ///
    /// Apart from switchback, the derived session never outlives the one
    /// it came from.
    pub async fn extend_web_session(&self, req: ExtendWebSessionRequest) -> Result<WebSession> {
        let prev = self.get_web_session(&req.prev_session_id).await?;
        if prev.user != req.user {
            return Err(AuthError::access_denied(
                "session does not belong to this user",
            ));
        }

        // Reload reads the user straight from the backend so trait changes
        // land even if a read-through cache sits in front of it elsewhere
        let user = self.users.get(&req.user).await?;
        let now = self.clock.now();

        let (role_names, expires, consumed, resource_ids, active_requests) = match &req.mode {
            ExtendMode::Reload => (
                prev.roles.clone(),
                prev.expires,
                prev.consumed_access_request_id.clone(),
                prev.resource_ids.clone(),
                prev.consumed_access_request_id
                    .clone()
                    .into_iter()
                    .collect(),
            ),
            ExtendMode::AccessRequest { request_id } => {
                let request = self.get_access_request(request_id).await?;
                if !request.approved {
                    return Err(AuthError::access_denied(format!(
                        "access request {request_id:?} is not approved"
                    )));
                }
                if request.user != req.user {
                    return Err(AuthError::access_denied(
                        "access request belongs to another user",
                    ));
                }
                if !request.resource_ids.is_empty() && !prev.resource_ids.is_empty() {
                    return Err(AuthError::bad_parameter(
                        "cannot assume a resource access request from a session that already has one",
                    ));
                }

                let mut merged = prev.roles.clone();
                for role in &request.roles {
                    if !merged.contains(role) {
                        merged.push(role.clone());
                    }
                }
                (
                    merged,
                    prev.expires.min(request.access_expiry),
                    Some(request.id.clone()),
                    request.resource_ids.clone(),
                    vec![request.id.clone()],
                )
            }
            ExtendMode::Switchback => {
                let static_set = self.roles.resolve(&user.roles).await?;
                let expires = prev.login_time
                    + chrono::Duration::from_std(static_set.max_session_ttl())
                        .unwrap_or_else(|_| chrono::Duration::zero());
                (user.roles.clone(), expires, None, Vec::new(), Vec::new())
            }
        };

        if expires <= now {
            return Err(AuthError::access_denied("session has expired"));
        }
        let ttl = (expires - now)
            .to_std()
            .map_err(|_| AuthError::bad_parameter("session TTL out of range"))?;

        let mut session = self
            .issue_session(
                &user,
                &role_names,
                ttl,
                prev.login_time,
                None,
                None,
                active_requests,
                consumed,
                resource_ids,
            )
            .await?;

        // Pin the exact expiry rather than the TTL-derived one so repeated
        // extensions cannot creep past the original window
        session.expires = expires;
        let item =
            marshal_item(session_key(&session.session_id), &session)?.with_expiry(session.expires);
        self.backend.put(item).await?;

        let _ = self
            .emitter
            .emit(AuditEvent::SessionExtended {
                user: session.user.clone(),
                session_id: session.session_id.clone(),
            })
            .await;

        Ok(session)
    }

    /// Fetch a session by ID
    pub async fn get_web_session(&self, session_id: &str) -> Result<WebSession> {
        let item = self.backend.get(&session_key(session_id)).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::not_found("web session is not found")
            } else {
                e
            }
        })?;
        unmarshal_item(&item)
    }

    /// Fetch a bearer token
    pub async fn get_web_token(&self, token: &str) -> Result<WebToken> {
        let item = self.backend.get(&token_key(token)).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::not_found("web token is not found")
            } else {
                e
            }
        })?;
        unmarshal_item(&item)
    }

    /// Delete a bearer token
    pub async fn delete_web_token(&self, token: &str) -> Result<()> {
        self.backend.delete(&token_key(token)).await
    }

    /// Delete a session and its bearer token
    pub async fn delete_web_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_web_session(session_id).await?;
        let _ = self.backend.delete(&token_key(&session.bearer_token)).await;
        self.backend.delete(&session_key(session_id)).await
    }

    /// Delete every session a user owns
    pub async fn delete_all_user_sessions(&self, user: &str) -> Result<()> {
        for item in self.backend.list("web/sessions/").await? {
            let session: WebSession = unmarshal_item(&item)?;
            if session.user == user {
                let _ = self.backend.delete(&token_key(&session.bearer_token)).await;
                let _ = self.backend.delete(&item.key).await;
            }
        }
        Ok(())
    }
}
