//! SSH certificate authority
//!
//! Produces OpenSSH user and host certificates from templated parameters.
//! Certificates are backdated one minute against clock skew; serials are
//! cryptographically random per certificate; extensions with empty values
//! are omitted entirely. RSA CA keys sign with RSA-SHA-512; Ed25519 and
//! ECDSA keys sign with their native algorithms.

use crate::clock::Clock;
use crate::types::{CertificateFormat, PrivateKeyPolicy};
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::{PrivateKey, PublicKey};
use std::time::Duration;

/// Clock-skew allowance baked into every `valid_after`
const SKEW_ALLOWANCE_SECS: u64 = 60;

/// Extension recording the MFA device that verified the issuance
pub const EXT_MFA_VERIFIED: &str = "mfa-verified";
/// Extension recording the user who requested the cert on another's behalf
pub const EXT_IMPERSONATOR: &str = "impersonator";
/// Extension recording role names, JSON-encoded
pub const EXT_ROLES: &str = "roles";
/// Extension forbidding the holder from requesting further certificates
pub const EXT_DISALLOW_REISSUE: &str = "disallow-reissue";
/// Extension marking a renewable (bot) certificate
pub const EXT_RENEWABLE: &str = "renewable";
/// Extension carrying the renewal generation counter
pub const EXT_GENERATION: &str = "generation";
/// Extension recording the private key policy the subject key satisfied
pub const EXT_PRIVATE_KEY_POLICY: &str = "private-key-policy";
/// Extension recording the trusted device inventory ID
pub const EXT_DEVICE_ID: &str = "device-id";
/// Extension recording the trusted device asset tag
pub const EXT_DEVICE_ASSET_TAG: &str = "device-asset-tag";
/// Extension recording the trusted device credential ID
pub const EXT_DEVICE_CREDENTIAL_ID: &str = "device-credential-id";
/// Extension recording resource IDs an access request narrowed the cert to
pub const EXT_ALLOWED_RESOURCES: &str = "allowed-resources";
/// Extension recording the expiry of the identity this one renews
pub const EXT_PREVIOUS_IDENTITY_EXPIRES: &str = "prev-identity-expires";
/// Critical option pinning the source address of every connection
pub const OPT_SOURCE_ADDRESS: &str = "source-address";
/// Extension recording the system role on host certificates
pub const EXT_HOST_ROLE: &str = "host-role";
/// Extension recording the issuing cluster on host certificates
pub const EXT_HOST_AUTHORITY: &str = "host-authority";

const PERMIT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Parameters for a user certificate
#[derive(Debug)]
pub struct UserCertParams {
    /// CA signing key
    pub ca_signer: PrivateKey,
    /// Key being certified
    pub public_key: PublicKey,
    /// Certificate key ID, conventionally the username
    pub username: String,
    /// Allowed logins
    pub principals: Vec<String>,
    /// Role names bound into the certificate
    pub roles: Vec<String>,
    /// Certificate lifetime
    pub ttl: Duration,
    /// Extension profile
    pub cert_format: CertificateFormat,
    /// MFA device that verified this issuance
    pub mfa_verified: Option<String>,
    /// Impersonating user
    pub impersonator: Option<String>,
    /// Trusted-device extensions, already serialized
    pub device_id: Option<String>,
    /// Trusted-device asset tag
    pub device_asset_tag: Option<String>,
    /// Trusted-device credential ID
    pub device_credential_id: Option<String>,
    /// Resource IDs the certificate is narrowed to, JSON-encoded
    pub allowed_resource_ids: Option<String>,
    /// Forbid reissue from this certificate
    pub disallow_reissue: bool,
    /// Renewable (bot) certificate
    pub renewable: bool,
    /// Renewal generation; zero means absent
    pub generation: u64,
    /// Pin every connection to this source IP
    pub source_ip: Option<String>,
    /// Expiry of the identity this certificate renews
    pub previous_identity_expires: Option<DateTime<Utc>>,
    /// Private key policy the subject key satisfied
    pub private_key_policy: PrivateKeyPolicy,
}

/// Parameters for a host certificate
#[derive(Debug)]
pub struct HostCertParams {
    /// CA signing key
    pub ca_signer: PrivateKey,
    /// Key being certified
    pub public_key: PublicKey,
    /// Host identifier, conventionally `"<uuid>.<cluster>"`
    pub host_id: String,
    /// Node name and additional principals the host answers to
    pub principals: Vec<String>,
    /// System role of the host (`node`, `proxy`, ...)
    pub role: String,
    /// Issuing cluster
    pub cluster_name: String,
    /// Certificate lifetime; zero means no expiry
    pub ttl: Duration,
}

fn validity_window(clock: &dyn Clock, ttl: Duration) -> (u64, u64) {
    let now = clock.now().timestamp().max(0) as u64;
    let valid_after = now.saturating_sub(SKEW_ALLOWANCE_SECS);
    let valid_before = if ttl.is_zero() {
        u64::MAX
    } else {
        now + ttl.as_secs()
    };
    (valid_after, valid_before)
}

/// Generate a user certificate
pub fn generate_user_cert(clock: &dyn Clock, params: &UserCertParams) -> Result<Certificate> {
    if params.username.is_empty() {
        return Err(AuthError::bad_parameter(
            "user certificate requires a username",
        ));
    }
    if params.principals.is_empty() {
        return Err(AuthError::bad_parameter(
            "user certificate requires at least one principal",
        ));
    }

    let (valid_after, valid_before) = validity_window(clock, params.ttl);
    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        params.public_key.key_data().clone(),
        valid_after,
        valid_before,
    )?;

    builder.serial(rand::random::<u64>())?;
    builder.cert_type(CertType::User)?;
    builder.key_id(params.username.as_str())?;
    for principal in &params.principals {
        builder.valid_principal(principal.as_str())?;
    }

    for permit in PERMIT_EXTENSIONS {
        builder.extension(permit, "")?;
    }

    // The compatibility format stops at the standard permits
    if params.cert_format == CertificateFormat::Standard {
        if !params.roles.is_empty() {
            builder.extension(EXT_ROLES, serde_json::to_string(&params.roles)?)?;
        }
        if let Some(device) = params.mfa_verified.as_deref().filter(|s| !s.is_empty()) {
            builder.extension(EXT_MFA_VERIFIED, device)?;
        }
        if let Some(imp) = params.impersonator.as_deref().filter(|s| !s.is_empty()) {
            builder.extension(EXT_IMPERSONATOR, imp)?;
        }
        if let Some(id) = params.device_id.as_deref().filter(|s| !s.is_empty()) {
            builder.extension(EXT_DEVICE_ID, id)?;
        }
        if let Some(tag) = params.device_asset_tag.as_deref().filter(|s| !s.is_empty()) {
            builder.extension(EXT_DEVICE_ASSET_TAG, tag)?;
        }
        if let Some(cred) = params
            .device_credential_id
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            builder.extension(EXT_DEVICE_CREDENTIAL_ID, cred)?;
        }
        if let Some(ids) = params
            .allowed_resource_ids
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            builder.extension(EXT_ALLOWED_RESOURCES, ids)?;
        }
        if params.disallow_reissue {
            builder.extension(EXT_DISALLOW_REISSUE, "")?;
        }
        if params.renewable {
            builder.extension(EXT_RENEWABLE, "")?;
        }
        if params.generation > 0 {
            builder.extension(EXT_GENERATION, params.generation.to_string())?;
        }
        if let Some(expires) = params.previous_identity_expires {
            builder.extension(
                EXT_PREVIOUS_IDENTITY_EXPIRES,
                expires.timestamp().to_string(),
            )?;
        }
        if params.private_key_policy != PrivateKeyPolicy::None {
            builder.extension(EXT_PRIVATE_KEY_POLICY, params.private_key_policy.as_str())?;
        }
    }

    if let Some(ip) = params.source_ip.as_deref().filter(|s| !s.is_empty()) {
        builder.critical_option(OPT_SOURCE_ADDRESS, format!("{ip}/32"))?;
    }

    Ok(builder.sign(&params.ca_signer)?)
}

/// Generate a host certificate
pub fn generate_host_cert(clock: &dyn Clock, params: &HostCertParams) -> Result<Certificate> {
    if params.host_id.is_empty() {
        return Err(AuthError::bad_parameter(
            "host certificate requires a host ID",
        ));
    }
    if params.role.is_empty() {
        return Err(AuthError::bad_parameter(
            "host certificate requires a system role",
        ));
    }

    let (valid_after, valid_before) = validity_window(clock, params.ttl);
    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        params.public_key.key_data().clone(),
        valid_after,
        valid_before,
    )?;

    builder.serial(rand::random::<u64>())?;
    builder.cert_type(CertType::Host)?;
    builder.key_id(params.host_id.as_str())?;
    builder.valid_principal(params.host_id.as_str())?;
    for principal in &params.principals {
        if principal != &params.host_id {
            builder.valid_principal(principal.as_str())?;
        }
    }
    builder.extension(EXT_HOST_ROLE, params.role.as_str())?;
    builder.extension(EXT_HOST_AUTHORITY, params.cluster_name.as_str())?;

    Ok(builder.sign(&params.ca_signer)?)
}
