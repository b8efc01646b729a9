//! Compact JWT signing for application access
//!
//! The JWT CA signs EdDSA tokens in compact JWS form. Only the claims the
//! authority itself mints are modeled; validation of third-party tokens is
//! an external-IdP concern.

use crate::clock::Clock;
use crate::{AuthError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Claims carried by an application-access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated username
    pub sub: String,
    /// Issuing cluster
    pub iss: String,
    /// Application URI the token is scoped to
    pub aud: String,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// Role names in effect
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// External traits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub traits: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Parameters for minting a token
#[derive(Debug, Clone)]
pub struct SignParams {
    /// Authenticated username
    pub username: String,
    /// Issuing cluster
    pub cluster: String,
    /// Application URI
    pub audience: String,
    /// Token lifetime
    pub ttl: Duration,
    /// Role names to embed
    pub roles: Vec<String>,
    /// Traits to embed
    pub traits: BTreeMap<String, Vec<String>>,
}

/// Mint a compact EdDSA JWT
pub fn sign(clock: &dyn Clock, key: &SigningKey, params: SignParams) -> Result<String> {
    if params.username.is_empty() {
        return Err(AuthError::bad_parameter("missing username for JWT"));
    }
    if params.audience.is_empty() {
        return Err(AuthError::bad_parameter("missing audience for JWT"));
    }

    let now = clock.now();
    let claims = Claims {
        sub: params.username,
        iss: params.cluster,
        aud: params.audience,
        exp: (now + params.ttl).timestamp(),
        iat: now.timestamp(),
        roles: params.roles,
        traits: params.traits,
    };

    let header = Header {
        alg: "EdDSA".to_string(),
        typ: "JWT".to_string(),
    };

    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = key.sign(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify a compact EdDSA JWT and return its claims
pub fn verify(clock: &dyn Clock, key: &VerifyingKey, token: &str) -> Result<Claims> {
    let mut parts = token.splitn(3, '.');
    let (header_b64, claims_b64, signature_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) => (h, c, s),
        _ => return Err(AuthError::bad_parameter("malformed JWT")),
    };

    let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
    if header.alg != "EdDSA" {
        return Err(AuthError::bad_parameter(format!(
            "unexpected JWT algorithm {:?}",
            header.alg
        )));
    }

    let signature_bytes = URL_SAFE_NO_PAD.decode(signature_b64)?;
    let signature = ed25519_dalek::Signature::from_slice(&signature_bytes)
        .map_err(|_| AuthError::access_denied("invalid JWT signature"))?;

    let signing_input = format!("{header_b64}.{claims_b64}");
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| AuthError::access_denied("invalid JWT signature"))?;

    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_b64)?)?;
    if claims.exp <= clock.now().timestamp() {
        return Err(AuthError::access_denied("JWT is expired"));
    }

    Ok(claims)
}
