//! Multi-factor authentication
//!
//! Enrollment and challenge of TOTP and WebAuthn authenticators (including
//! the passwordless variant), safe device deletion under the cluster
//! second-factor policy, and the failed-login lockout wrapper.

pub mod totp;
pub mod webauthn;

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::events::{AuditEmitter, AuditEvent};
use crate::roles::UserStore;
use crate::types::{SecondFactorPolicy, MAX_DEVICE_NAME_LEN};
use crate::{AuthError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use totp::{TotpAlgorithm, TotpSpec};
use tracing::{info, warn};
use uuid::Uuid;
use webauthn::{WebauthnAssertion, WebauthnChallenge, WebauthnCredential};

/// How long privilege tokens and MFA challenges live
const CHALLENGE_TTL_SECS: i64 = 5 * 60;

/// Kind of second-factor device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// RFC 6238 authenticator app
    Totp,
    /// FIDO2 authenticator
    Webauthn,
    /// Legacy U2F registration; read-only compatibility
    U2f,
}

impl DeviceKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Webauthn => "webauthn",
            Self::U2f => "u2f",
        }
    }
}

/// Per-kind secret material of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    /// TOTP secret and parameters
    Totp(TotpSpec),
    /// WebAuthn credential
    Webauthn(WebauthnCredential),
    /// Legacy U2F registration
    U2f {
        /// Key handle issued at registration
        key_handle: Vec<u8>,
        /// Raw public key
        public_key: Vec<u8>,
    },
}

/// An enrolled MFA device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaDevice {
    /// Stable device ID, recorded into certificates as `mfa-verified`
    pub id: String,
    /// Device name, unique per user, at most 30 characters
    pub name: String,
    /// Enrollment time
    pub added_at: DateTime<Utc>,
    /// Last successful verification
    pub last_used: Option<DateTime<Utc>>,
    /// Secret material
    pub state: DeviceState,
}

impl MfaDevice {
    /// Kind of this device
    pub fn kind(&self) -> DeviceKind {
        match self.state {
            DeviceState::Totp(_) => DeviceKind::Totp,
            DeviceState::Webauthn(_) => DeviceKind::Webauthn,
            DeviceState::U2f { .. } => DeviceKind::U2f,
        }
    }
}

/// Purpose of a privilege token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTokenKind {
    /// Issued during password reset
    ResetPassword,
    /// Issued after a fresh MFA verification
    Privilege,
    /// Issued after an approved account recovery
    RecoveryApproved,
}

/// A short-lived token authorizing device enrollment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeToken {
    /// Opaque token ID
    pub id: String,
    /// User the token belongs to
    pub user: String,
    /// What minted the token
    pub kind: PrivilegeTokenKind,
    /// Expiry
    pub expires: DateTime<Utc>,
}

/// TOTP parameters handed to the enrolling client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpRegisterParams {
    /// Shared secret, hex-encoded
    pub secret_hex: String,
    /// Time step in seconds
    pub period: u32,
    /// Code length
    pub digits: u32,
    /// HMAC algorithm
    pub algorithm: TotpAlgorithm,
}

/// A registration challenge for one device kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterChallenge {
    /// Privilege token the challenge is bound to
    pub token_id: String,
    /// TOTP enrollment parameters, for TOTP registrations
    pub totp: Option<TotpRegisterParams>,
    /// WebAuthn creation challenge, for WebAuthn registrations
    pub webauthn_challenge: Option<Vec<u8>>,
}

/// The client's answer to a registration challenge
#[derive(Debug, Clone)]
pub enum RegisterResponse {
    /// A code proving possession of the offered TOTP secret
    Totp {
        /// Current code
        code: String,
    },
    /// The credential created by the authenticator
    Webauthn {
        /// New credential
        credential: WebauthnCredential,
    },
}

/// An authentication challenge assembled from the user's devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateChallenge {
    /// Whether a TOTP code is accepted
    pub totp: bool,
    /// WebAuthn challenge, when the user has WebAuthn devices (or always,
    /// for passwordless)
    pub webauthn: Option<WebauthnChallenge>,
}

/// The client's answer to an authentication challenge
#[derive(Debug, Clone)]
pub enum AuthenticateResponse {
    /// A TOTP code
    Totp {
        /// Current code
        code: String,
    },
    /// A WebAuthn assertion
    Webauthn {
        /// Signed assertion
        assertion: WebauthnAssertion,
    },
}

#[derive(Serialize, Deserialize)]
struct PendingRegistration {
    user: String,
    kind: DeviceKind,
    totp: Option<TotpSpec>,
    webauthn_challenge: Option<Vec<u8>>,
}

fn privilege_token_key(id: &str) -> String {
    format!("privilegetokens/{id}")
}

fn register_key(token_id: &str) -> String {
    format!("mfa/register/{token_id}")
}

fn authn_challenge_key(user: &str) -> String {
    format!("mfa/authn/{user}")
}

fn device_key(user: &str, name: &str) -> String {
    format!("{}{}", crate::roles::user_devices_prefix(user), name)
}

fn random_hex_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The MFA subsystem
pub struct MfaService {
    backend: Arc<dyn Backend>,
    users: UserStore,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn AuditEmitter>,
    second_factor: SecondFactorPolicy,
    lockout: LockoutConfig,
}

impl MfaService {
    /// Assemble the subsystem
    pub fn new(
        backend: Arc<dyn Backend>,
        users: UserStore,
        clock: Arc<dyn Clock>,
        emitter: Arc<dyn AuditEmitter>,
        second_factor: SecondFactorPolicy,
        lockout: LockoutConfig,
    ) -> Self {
        Self {
            backend,
            users,
            clock,
            emitter,
            second_factor,
            lockout,
        }
    }

    fn challenge_expiry(&self) -> DateTime<Utc> {
        self.clock.now() + ChronoDuration::seconds(CHALLENGE_TTL_SECS)
    }

    /// Mint a privilege token for a user
    pub async fn create_privilege_token(
        &self,
        user: &str,
        kind: PrivilegeTokenKind,
    ) -> Result<PrivilegeToken> {
        let token = PrivilegeToken {
            id: random_hex_token(),
            user: user.to_string(),
            kind,
            expires: self.challenge_expiry(),
        };
        let item = marshal_item(privilege_token_key(&token.id), &token)?.with_expiry(token.expires);
        self.backend.create(item).await?;
        Ok(token)
    }

    async fn take_privilege_token(&self, token_id: &str) -> Result<PrivilegeToken> {
        let item = self
            .backend
            .get(&privilege_token_key(token_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    AuthError::access_denied("invalid or expired privilege token")
                } else {
                    e
                }
            })?;
        unmarshal_item(&item)
    }

    /// Phase one of enrollment: create a registration challenge bound to a
    /// privilege token
    pub async fn create_register_challenge(
        &self,
        token_id: &str,
        kind: DeviceKind,
    ) -> Result<RegisterChallenge> {
        let token = self.take_privilege_token(token_id).await?;

        if self.second_factor == SecondFactorPolicy::Off {
            return Err(AuthError::bad_parameter(
                "second factors are disabled by the cluster policy",
            ));
        }

        let (totp_params, webauthn_challenge, pending) = match kind {
            DeviceKind::Totp => {
                if !self.second_factor.allows_totp() {
                    return Err(AuthError::bad_parameter(
                        "the cluster second-factor policy does not allow TOTP devices",
                    ));
                }
                let mut secret = vec![0u8; 20];
                rand::rngs::OsRng.fill_bytes(&mut secret);
                let spec = TotpSpec::generate(secret);
                (
                    Some(TotpRegisterParams {
                        secret_hex: hex::encode(&spec.secret),
                        period: spec.period,
                        digits: spec.digits,
                        algorithm: spec.algorithm,
                    }),
                    None,
                    PendingRegistration {
                        user: token.user.clone(),
                        kind,
                        totp: Some(spec),
                        webauthn_challenge: None,
                    },
                )
            }
            DeviceKind::Webauthn => {
                if !self.second_factor.allows_webauthn() {
                    return Err(AuthError::bad_parameter(
                        "the cluster second-factor policy does not allow WebAuthn devices",
                    ));
                }
                let challenge = WebauthnChallenge::generate(Vec::new(), false);
                (
                    None,
                    Some(challenge.challenge.clone()),
                    PendingRegistration {
                        user: token.user.clone(),
                        kind,
                        totp: None,
                        webauthn_challenge: Some(challenge.challenge),
                    },
                )
            }
            DeviceKind::U2f => {
                return Err(AuthError::bad_parameter(
                    "U2F devices are read-only legacy and cannot be enrolled",
                ));
            }
        };

        let item = marshal_item(register_key(token_id), &pending)?
            .with_expiry(self.challenge_expiry());
        self.backend.put(item).await?;

        Ok(RegisterChallenge {
            token_id: token_id.to_string(),
            totp: totp_params,
            webauthn_challenge,
        })
    }

    /// Phase two of enrollment: verify the response and persist the device.
    ///
    /// Consumes the privilege token and the pending registration, so the
    /// token cannot authorize a second device.
    pub async fn add_device_sync(
        &self,
        token_id: &str,
        device_name: &str,
        response: RegisterResponse,
    ) -> Result<MfaDevice> {
        let token = self.take_privilege_token(token_id).await?;

        if device_name.is_empty() || device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(AuthError::bad_parameter(format!(
                "device name must be between 1 and {MAX_DEVICE_NAME_LEN} characters"
            )));
        }

        let pending_item = self.backend.get(&register_key(token_id)).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::access_denied("no registration challenge outstanding for this token")
            } else {
                e
            }
        })?;
        let pending: PendingRegistration = unmarshal_item(&pending_item)?;

        if self
            .get_device(&token.user, device_name)
            .await?
            .is_some()
        {
            return Err(AuthError::already_exists(format!(
                "user {:?} already has a device named {device_name:?}",
                token.user
            )));
        }

        let state = match (&response, pending.kind) {
            (RegisterResponse::Totp { code }, DeviceKind::Totp) => {
                let spec = pending.totp.ok_or_else(|| {
                    AuthError::bad_parameter("registration challenge is missing TOTP parameters")
                })?;
                if !spec.verify(self.clock.now().timestamp(), code, 1) {
                    return Err(AuthError::access_denied("invalid TOTP code"));
                }
                DeviceState::Totp(spec)
            }
            (RegisterResponse::Webauthn { credential }, DeviceKind::Webauthn) => {
                if credential.credential_id.is_empty() {
                    return Err(AuthError::bad_parameter(
                        "WebAuthn credential is missing its ID",
                    ));
                }
                if credential.resident_key && !self.second_factor.allows_webauthn() {
                    return Err(AuthError::bad_parameter(
                        "the cluster second-factor policy does not allow WebAuthn devices",
                    ));
                }
                DeviceState::Webauthn(credential.clone())
            }
            _ => {
                return Err(AuthError::bad_parameter(
                    "registration response does not match the challenged device kind",
                ));
            }
        };

        let device = MfaDevice {
            id: Uuid::new_v4().to_string(),
            name: device_name.to_string(),
            added_at: self.clock.now(),
            last_used: None,
            state,
        };

        let item = marshal_item(device_key(&token.user, device_name), &device)?;
        self.backend.create(item).await?;

        // Consume the token and the pending registration
        let _ = self.backend.delete(&privilege_token_key(token_id)).await;
        let _ = self.backend.delete(&register_key(token_id)).await;

        info!(user = %token.user, device = device_name, kind = device.kind().as_str(), "MFA device enrolled");
        let _ = self
            .emitter
            .emit(AuditEvent::MfaDeviceAdded {
                user: token.user.clone(),
                device_name: device.name.clone(),
                device_kind: device.kind().as_str().to_string(),
            })
            .await;

        Ok(device)
    }

    /// Every device the user has enrolled
    pub async fn list_devices(&self, user: &str) -> Result<Vec<MfaDevice>> {
        let items = self
            .backend
            .list(&crate::roles::user_devices_prefix(user))
            .await?;
        let mut devices = Vec::new();
        for item in &items {
            devices.push(unmarshal_item(item)?);
        }
        Ok(devices)
    }

    async fn get_device(&self, user: &str, name: &str) -> Result<Option<MfaDevice>> {
        match self.backend.get(&device_key(user, name)).await {
            Ok(item) => Ok(Some(unmarshal_item(&item)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build an authentication challenge from the user's registered devices.
    ///
    /// Passwordless ceremonies are WebAuthn-only with an empty allow list;
    /// the authenticator answers with a resident credential.
    pub async fn create_authenticate_challenge(
        &self,
        user: &str,
        passwordless: bool,
    ) -> Result<AuthenticateChallenge> {
        if passwordless {
            let challenge = WebauthnChallenge::generate(Vec::new(), true);
            let item = marshal_item(authn_challenge_key(user), &challenge)?
                .with_expiry(self.challenge_expiry());
            self.backend.put(item).await?;
            return Ok(AuthenticateChallenge {
                totp: false,
                webauthn: Some(challenge),
            });
        }

        let devices = self.list_devices(user).await?;
        let has_totp = devices.iter().any(|d| d.kind() == DeviceKind::Totp);
        let webauthn_ids: Vec<Vec<u8>> = devices
            .iter()
            .filter_map(|d| match &d.state {
                DeviceState::Webauthn(c) => Some(c.credential_id.clone()),
                _ => None,
            })
            .collect();

        let webauthn = if webauthn_ids.is_empty() {
            None
        } else {
            let challenge = WebauthnChallenge::generate(webauthn_ids, false);
            let item = marshal_item(authn_challenge_key(user), &challenge)?
                .with_expiry(self.challenge_expiry());
            self.backend.put(item).await?;
            Some(challenge)
        };

        Ok(AuthenticateChallenge {
            totp: has_totp,
            webauthn,
        })
    }

    /// Validate an authentication response, returning the device that
    /// verified it. The device ID flows into subsequent certificate
    /// requests as the MFA-verified device.
    pub async fn validate_auth_response(
        &self,
        user: &str,
        response: AuthenticateResponse,
    ) -> Result<MfaDevice> {
        let devices = match self.users.get(user).await {
            Ok(_) => self.list_devices(user).await?,
            Err(e) if e.is_not_found() => {
                // Unknown user: run a verification that cannot succeed so
                // response timing does not reveal which users exist
                self.burn_response(&response);
                return Err(AuthError::access_denied("invalid authentication"));
            }
            Err(e) => return Err(e),
        };

        match response {
            AuthenticateResponse::Totp { code } => {
                let now = self.clock.now().timestamp();
                let mut matched: Option<MfaDevice> = None;
                for device in devices {
                    let verified = match &device.state {
                        DeviceState::Totp(spec) => spec.verify(now, &code, 1),
                        _ => false,
                    };
                    if verified && matched.is_none() {
                        matched = Some(device);
                    }
                }
                match matched {
                    Some(device) => self.touch_device(user, device).await,
                    None => Err(AuthError::access_denied("invalid TOTP code")),
                }
            }
            AuthenticateResponse::Webauthn { assertion } => {
                let challenge_item =
                    self.backend.get(&authn_challenge_key(user)).await.map_err(|e| {
                        if e.is_not_found() {
                            AuthError::access_denied("no authentication challenge outstanding")
                        } else {
                            e
                        }
                    })?;
                let challenge: WebauthnChallenge = unmarshal_item(&challenge_item)?;

                let mut device = devices
                    .into_iter()
                    .find(|d| match &d.state {
                        DeviceState::Webauthn(c) => c.credential_id == assertion.credential_id,
                        _ => false,
                    })
                    .ok_or_else(|| AuthError::access_denied("unknown credential"))?;

                if let DeviceState::Webauthn(credential) = &mut device.state {
                    if challenge.passwordless && !credential.resident_key {
                        return Err(AuthError::access_denied(
                            "passwordless login requires a resident credential",
                        ));
                    }
                    let new_counter =
                        webauthn::verify_assertion(credential, &challenge.challenge, &assertion)?;
                    credential.counter = new_counter;
                }

                let _ = self.backend.delete(&authn_challenge_key(user)).await;
                self.touch_device(user, device).await
            }
        }
    }

    fn burn_response(&self, response: &AuthenticateResponse) {
        if let AuthenticateResponse::Totp { code } = response {
            let decoy = TotpSpec::generate(vec![0u8; 20]);
            let _ = decoy.verify(self.clock.now().timestamp(), code, 1);
        }
    }

    async fn touch_device(&self, user: &str, mut device: MfaDevice) -> Result<MfaDevice> {
        device.last_used = Some(self.clock.now());
        let item = marshal_item(device_key(user, &device.name), &device)?;
        self.backend.put(item).await?;
        Ok(device)
    }

    /// Delete a device, refusing when the deletion would leave the user
    /// unable to satisfy the cluster second-factor policy
    pub async fn delete_device_sync(&self, user: &str, name: &str) -> Result<()> {
        let devices = self.list_devices(user).await?;
        let target = devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AuthError::not_found(format!("device {name:?} is not found")))?
            .clone();

        let remaining: Vec<&MfaDevice> = devices.iter().filter(|d| d.name != name).collect();
        let remaining_totp = remaining
            .iter()
            .filter(|d| d.kind() == DeviceKind::Totp)
            .count();
        let remaining_webauthn = remaining
            .iter()
            .filter(|d| d.kind() == DeviceKind::Webauthn)
            .count();

        match self.second_factor {
            SecondFactorPolicy::On if remaining.is_empty() => {
                return Err(AuthError::bad_parameter(
                    "cannot delete the last MFA device for this user",
                ));
            }
            SecondFactorPolicy::Otp if remaining_totp == 0 => {
                return Err(AuthError::bad_parameter(
                    "cannot delete the last TOTP device while the cluster requires one",
                ));
            }
            SecondFactorPolicy::Webauthn if remaining_webauthn == 0 => {
                return Err(AuthError::bad_parameter(
                    "cannot delete the last WebAuthn device while the cluster requires one",
                ));
            }
            _ => {}
        }

        self.backend.delete(&device_key(user, name)).await?;

        let _ = self
            .emitter
            .emit(AuditEvent::MfaDeviceDeleted {
                user: user.to_string(),
                device_name: target.name.clone(),
                device_kind: target.kind().as_str().to_string(),
            })
            .await;
        info!(user, device = name, "MFA device deleted");
        Ok(())
    }

    /// Run an authentication attempt under the failed-login lockout policy.
    ///
    /// Administrative locks fail immediately. Success clears the failure
    /// counter. Transient backend failures are not counted. Any other
    /// failure is recorded, and when the last N attempts within the window
    /// all failed, the user is locked for the configured interval.
    pub async fn with_user_lock<T, F, Fut>(&self, username: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let user = match self.users.get(username).await {
            Ok(user) => Some(user),
            // The attempt still runs for unknown users so that failure
            // timing does not reveal which users exist
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if let Some(user) = &user {
            if user.status.locked_at(self.clock.now()) {
                return Err(AuthError::access_denied(format!(
                    "user {username:?} is locked: {}",
                    user.status
                        .lock_reason
                        .as_deref()
                        .unwrap_or("administratively locked")
                )));
            }
        }

        match f().await {
            Ok(value) => {
                if user.is_some() {
                    self.clear_failed_attempts(username).await?;
                }
                Ok(value)
            }
            Err(e) if e.is_connection_problem() => Err(e),
            Err(e) => {
                if user.is_some() {
                    if let Some(locked_err) = self.record_failed_attempt(username).await? {
                        return Err(locked_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn clear_failed_attempts(&self, username: &str) -> Result<()> {
        loop {
            let mut user = self.users.get(username).await?;
            if user.status.failed_attempts.is_empty() && !user.status.is_locked {
                return Ok(());
            }
            user.status.failed_attempts.clear();
            user.status.is_locked = false;
            user.status.locked_until = None;
            user.status.lock_reason = None;
            match self.users.compare_and_swap(&user).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_compare_failed() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Record one failed attempt; returns the lockout error when the policy
    /// trips. Uses compare-and-swap so concurrent failures all count.
    async fn record_failed_attempt(&self, username: &str) -> Result<Option<AuthError>> {
        loop {
            let mut user = self.users.get(username).await?;
            let now = self.clock.now();
            let window = ChronoDuration::from_std(self.lockout.attempt_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(30));

            user.status.failed_attempts.push(now);
            user.status
                .failed_attempts
                .retain(|&t| now - t <= window);

            let tripped = user.status.failed_attempts.len() >= self.lockout.max_attempts as usize;
            if tripped {
                let until = now
                    + ChronoDuration::from_std(self.lockout.lock_interval)
                        .unwrap_or_else(|_| ChronoDuration::minutes(20));
                user.status.is_locked = true;
                user.status.locked_until = Some(until);
                user.status.lock_reason = Some(format!(
                    "{} consecutive failed login attempts",
                    user.status.failed_attempts.len()
                ));

                match self.users.compare_and_swap(&user).await {
                    Ok(_) => {
                        warn!(user = username, until = %until, "user locked after repeated failures");
                        let _ = self
                            .emitter
                            .emit(AuditEvent::UserLocked {
                                user: username.to_string(),
                                until,
                                reason: user.status.lock_reason.clone().unwrap_or_default(),
                            })
                            .await;
                        return Ok(Some(AuthError::access_denied(format!(
                            "user {username:?} is locked until {until} after repeated failed login attempts"
                        ))));
                    }
                    Err(e) if e.is_compare_failed() => continue,
                    Err(e) => return Err(e),
                }
            }

            match self.users.compare_and_swap(&user).await {
                Ok(_) => return Ok(None),
                Err(e) if e.is_compare_failed() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
