//! TLS certificate authority
//!
//! Mints X.509 leaves whose subject carries a marshaled [`Identity`], plus
//! the self-signed CA certificates the keystore stages and the CRLs the
//! database path serves.

use crate::clock::Clock;
use crate::identity::Identity;
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, CertificateRevocationListParams, DnType, ExtendedKeyUsagePurpose, Issuer,
    KeyIdMethod, KeyPair, KeyUsagePurpose, RevokedCertParams, SerialNumber,
    SubjectPublicKeyInfo,
};
use time::{Duration as TimeDuration, OffsetDateTime};

/// Clock-skew allowance baked into every `not_before`
const SKEW_ALLOWANCE_SECS: i64 = 60;

/// Default lifetime of a self-signed CA certificate
const CA_CERT_VALIDITY_DAYS: i64 = 3650;

fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| AuthError::X509(format!("timestamp out of range: {e}")))
}

/// Build a self-signed CA certificate for a CA keypair
pub fn build_ca_cert(clock: &dyn Clock, common_name: &str, key_pair: &KeyPair) -> Result<String> {
    let mut params = CertificateParams::new(Vec::new())?;

    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = to_offset(clock.now())?;
    params.not_before = now - TimeDuration::seconds(SKEW_ALLOWANCE_SECS);
    params.not_after = now + TimeDuration::days(CA_CERT_VALIDITY_DAYS);

    let cert = params.self_signed(key_pair)?;
    Ok(cert.pem())
}

/// A request for an X.509 leaf certificate
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    /// Identity marshaled into the subject
    pub identity: Identity,
    /// Subject public key, SPKI PEM
    pub subject_public_key_pem: String,
    /// Caller-specified expiry
    pub not_after: DateTime<Utc>,
    /// Additional DNS SANs
    pub dns_names: Vec<String>,
}

/// Mint an X.509 leaf signed by the CA.
///
/// `not_before` is backdated one minute to absorb clock skew between
/// cluster members; key usages cover both server and client authentication.
pub fn generate_certificate(
    clock: &dyn Clock,
    ca_cert_pem: &str,
    ca_key: KeyPair,
    req: &CertificateRequest,
) -> Result<String> {
    if req.identity.username.is_empty() {
        return Err(AuthError::bad_parameter(
            "certificate request is missing an identity username",
        ));
    }

    let mut params = CertificateParams::new(req.dns_names.clone())?;
    params.distinguished_name = req.identity.to_distinguished_name()?;
    params.is_ca = rcgen::IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = to_offset(clock.now())?;
    params.not_before = now - TimeDuration::seconds(SKEW_ALLOWANCE_SECS);
    params.not_after = to_offset(req.not_after)?;

    let subject_key = SubjectPublicKeyInfo::from_pem(&req.subject_public_key_pem)
        .map_err(|e| AuthError::bad_parameter(format!("invalid subject public key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)?;

    let cert = params.signed_by(&subject_key, &issuer)?;
    Ok(cert.pem())
}

/// A revoked certificate entry for CRL generation
#[derive(Debug, Clone)]
pub struct RevokedCert {
    /// Serial of the revoked certificate
    pub serial: u64,
    /// When it was revoked
    pub revoked_at: DateTime<Utc>,
}

/// Sign a certificate revocation list, possibly empty
pub fn generate_crl(
    clock: &dyn Clock,
    ca_cert_pem: &str,
    ca_key: KeyPair,
    revoked: &[RevokedCert],
) -> Result<String> {
    let now = to_offset(clock.now())?;
    let params = CertificateRevocationListParams {
        this_update: now,
        next_update: now + TimeDuration::days(365),
        crl_number: SerialNumber::from(now.unix_timestamp() as u64),
        issuing_distribution_point: None,
        revoked_certs: revoked
            .iter()
            .map(|r| {
                Ok(RevokedCertParams {
                    serial_number: SerialNumber::from(r.serial),
                    revocation_time: to_offset(r.revoked_at)?,
                    reason_code: None,
                    invalidity_date: None,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        key_identifier_method: KeyIdMethod::Sha256,
    };

    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)?;
    let crl = params.signed_by(&issuer)?;
    Ok(crl.pem()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn ca() -> (ManualClock, String, String) {
        let clock = ManualClock::default();
        let key = KeyPair::generate().unwrap();
        let cert = build_ca_cert(&clock, "example.com", &key).unwrap();
        (clock, cert, key.serialize_pem())
    }

    #[test]
    fn test_leaf_carries_identity_and_skew() {
        let (clock, ca_cert, ca_key_pem) = ca();

        let subject_key = KeyPair::generate().unwrap();
        let identity = Identity {
            username: "alice".to_string(),
            roles: vec!["access".to_string()],
            ..Default::default()
        };
        let req = CertificateRequest {
            identity: identity.clone(),
            subject_public_key_pem: subject_key.public_key_pem(),
            not_after: clock.now() + Duration::hours(1),
            dns_names: Vec::new(),
        };

        let pem = generate_certificate(
            &clock,
            &ca_cert,
            KeyPair::from_pem(&ca_key_pem).unwrap(),
            &req,
        )
        .unwrap();

        let decoded = Identity::from_pem_cert(&pem).unwrap();
        assert_eq!(decoded, identity);

        let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = doc.parse_x509().unwrap();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert_eq!(not_before, clock.now().timestamp() - 60);
        assert_eq!(not_after, req.not_after.timestamp());
    }

    #[test]
    fn test_missing_username_rejected() {
        let (clock, ca_cert, ca_key_pem) = ca();
        let subject_key = KeyPair::generate().unwrap();
        let req = CertificateRequest {
            identity: Identity::default(),
            subject_public_key_pem: subject_key.public_key_pem(),
            not_after: clock.now() + Duration::hours(1),
            dns_names: Vec::new(),
        };
        let err = generate_certificate(
            &clock,
            &ca_cert,
            KeyPair::from_pem(&ca_key_pem).unwrap(),
            &req,
        )
        .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[test]
    fn test_crl_signs_empty_and_populated() {
        let (clock, ca_cert, ca_key_pem) = ca();

        let crl = generate_crl(
            &clock,
            &ca_cert,
            KeyPair::from_pem(&ca_key_pem).unwrap(),
            &[],
        )
        .unwrap();
        assert!(crl.contains("BEGIN X509 CRL"));

        let revoked = vec![RevokedCert {
            serial: 42,
            revoked_at: clock.now(),
        }];
        let crl = generate_crl(
            &clock,
            &ca_cert,
            KeyPair::from_pem(&ca_key_pem).unwrap(),
            &revoked,
        )
        .unwrap();
        assert!(crl.contains("BEGIN X509 CRL"));
    }
}
