//! WebAuthn credential binding and assertion verification
//!
//! The core stores the credential public key enrolled by the client and
//! verifies assertion signatures over `authenticator_data || SHA-256(challenge)`
//! with clone detection via the signature counter. CTAP attestation-format
//! validation happens in the external validator before enrollment reaches
//! this module.

use crate::{AuthError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a registration or authentication challenge
pub const CHALLENGE_LEN: usize = 32;

/// Public key of an enrolled credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alg", rename_all = "snake_case")]
pub enum CredentialPublicKey {
    /// Ed25519 (COSE -8)
    Ed25519 {
        /// 32-byte public key
        public_key: Vec<u8>,
    },
    /// ECDSA P-256 with SHA-256 (COSE -7)
    Es256 {
        /// SEC1-encoded public key
        public_key_sec1: Vec<u8>,
    },
}

/// An enrolled WebAuthn credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebauthnCredential {
    /// Credential ID chosen by the authenticator
    pub credential_id: Vec<u8>,
    /// Public key enrolled with the credential
    pub public_key: CredentialPublicKey,
    /// Last observed signature counter
    pub counter: u32,
    /// Whether the credential is resident (usable passwordless)
    pub resident_key: bool,
}

/// A challenge offered to an authenticator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebauthnChallenge {
    /// Random challenge bytes
    pub challenge: Vec<u8>,
    /// Credential IDs the user may answer with; empty for passwordless,
    /// where the authenticator picks a resident credential
    pub allow_credentials: Vec<Vec<u8>>,
    /// Whether this is a passwordless (resident-key) ceremony
    pub passwordless: bool,
}

impl WebauthnChallenge {
    /// A fresh random challenge
    pub fn generate(allow_credentials: Vec<Vec<u8>>, passwordless: bool) -> Self {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self {
            challenge,
            allow_credentials,
            passwordless,
        }
    }
}

/// An authenticator's answer to a challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebauthnAssertion {
    /// Credential that signed
    pub credential_id: Vec<u8>,
    /// Raw authenticator data covered by the signature
    pub authenticator_data: Vec<u8>,
    /// Signature over `authenticator_data || SHA-256(challenge)`;
    /// DER-encoded for ES256, raw 64 bytes for Ed25519
    pub signature: Vec<u8>,
    /// Signature counter reported by the authenticator
    pub counter: u32,
}

/// Verify an assertion against a stored credential and the challenge it
/// answers. Returns the new signature counter to persist.
pub fn verify_assertion(
    credential: &WebauthnCredential,
    challenge: &[u8],
    assertion: &WebauthnAssertion,
) -> Result<u32> {
    if assertion.credential_id != credential.credential_id {
        return Err(AuthError::access_denied("unknown credential"));
    }

    let mut message = assertion.authenticator_data.clone();
    message.extend_from_slice(&Sha256::digest(challenge));

    match &credential.public_key {
        CredentialPublicKey::Ed25519 { public_key } => {
            use ed25519_dalek::{Signature, Verifier, VerifyingKey};
            let key_bytes: [u8; 32] = public_key
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::bad_parameter("malformed Ed25519 credential key"))?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| AuthError::bad_parameter("malformed Ed25519 credential key"))?;
            let signature = Signature::from_slice(&assertion.signature)
                .map_err(|_| AuthError::access_denied("invalid assertion signature"))?;
            key.verify(&message, &signature)
                .map_err(|_| AuthError::access_denied("invalid assertion signature"))?;
        }
        CredentialPublicKey::Es256 { public_key_sec1 } => {
            use p256::ecdsa::signature::Verifier;
            use p256::ecdsa::{Signature, VerifyingKey};
            let key = VerifyingKey::from_sec1_bytes(public_key_sec1)
                .map_err(|_| AuthError::bad_parameter("malformed ES256 credential key"))?;
            let signature = Signature::from_der(&assertion.signature)
                .map_err(|_| AuthError::access_denied("invalid assertion signature"))?;
            key.verify(&message, &signature)
                .map_err(|_| AuthError::access_denied("invalid assertion signature"))?;
        }
    }

    // A counter that fails to advance suggests a cloned authenticator
    if (credential.counter > 0 || assertion.counter > 0)
        && assertion.counter <= credential.counter
    {
        return Err(AuthError::access_denied(
            "credential counter did not advance; possible cloned authenticator",
        ));
    }

    Ok(assertion.counter)
}
