//! Secondary artifact paths
//!
//! OpenSSH-CA certificates, database server certificates, JWTs, CRLs,
//! device-trust augmentation, provision tokens, and cluster alerts.

mod common;

use common::{role, ssh_keypair, test_authority};
use tokio_test::assert_ok;
use cluster_authority::clock::Clock;
use cluster_authority::identity::{DeviceExtensions, Identity};
use cluster_authority::issuance::{
    AugmentRequest, CertRequest, DatabaseCertRequest, JwtRequest,
};
use cluster_authority::token::ProvisionToken;
use cluster_authority::types::Labels;
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Test: the OpenSSH CA path yields no TLS certificate
// ============================================================================

#[tokio::test]
async fn test_open_ssh_cert_has_no_tls() {
    let t = test_authority().await;
    let (user, roles) = t
        .seed_user("alice", vec![role("access", &["alice"], Duration::from_secs(3600))])
        .await;

    let tls_key = rcgen::KeyPair::generate().unwrap();
    let mut req = CertRequest::new(
        user,
        roles,
        common::ssh_public_key(),
        Duration::from_secs(600),
    );
    // Even when a TLS key is supplied, the OpenSSH path ignores it
    req.tls_public_key_pem = Some(tls_key.public_key_pem());

    let certs = t
        .authority
        .issuance
        .generate_open_ssh_cert(req)
        .await
        .unwrap();
    assert!(certs.tls.is_none());
    assert!(!certs.ssh.is_empty());
    assert!(!certs.ssh_ca_certs.is_empty());
}

// ============================================================================
// Test: database server certificates carry the requested SANs
// ============================================================================

#[tokio::test]
async fn test_database_cert() {
    let t = test_authority().await;
    let subject_key = rcgen::KeyPair::generate().unwrap();

    let certs = t
        .authority
        .issuance
        .generate_database_cert(DatabaseCertRequest {
            server_name: "pg.example.com".to_string(),
            server_names: vec!["pg-replica.example.com".to_string()],
            subject_public_key_pem: subject_key.public_key_pem(),
            ttl: Duration::from_secs(24 * 3600),
        })
        .await
        .unwrap();

    let pem = certs.tls.unwrap();
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
    let cert = doc.parse_x509().unwrap();
    let san = cert
        .subject_alternative_name()
        .unwrap()
        .expect("certificate has no SAN extension");
    let dns: Vec<String> = san
        .value
        .general_names
        .iter()
        .filter_map(|n| match n {
            x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
            _ => None,
        })
        .collect();
    assert!(dns.contains(&"pg.example.com".to_string()));
    assert!(dns.contains(&"pg-replica.example.com".to_string()));
    assert!(!certs.tls_ca_certs.is_empty());
}

// ============================================================================
// Test: JWTs verify against the JWT CA's public key
// ============================================================================

#[tokio::test]
async fn test_jwt_round_trip() {
    let t = test_authority().await;

    let token = t
        .authority
        .issuance
        .generate_jwt(JwtRequest {
            username: "alice".to_string(),
            audience: "https://app.example.com".to_string(),
            ttl: Duration::from_secs(300),
            roles: vec!["access".to_string()],
            traits: BTreeMap::new(),
        })
        .await
        .unwrap();

    // Pull the verifying key straight out of the JWT CA record
    let ca = t
        .authority
        .cas
        .get(&cluster_authority::ca::CaId::new(
            cluster_authority::types::CertAuthType::Jwt,
            "example.com",
        ))
        .await
        .unwrap();
    let public = ssh_key::PublicKey::from_openssh(&ca.active_keys.jwt[0].public_key).unwrap();
    let ed = public.key_data().ed25519().unwrap();
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&ed.0).unwrap();

    let claims =
        cluster_authority::jwt::verify(t.clock.as_ref(), &verifying, &token).unwrap();
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.iss, "example.com");
}

// ============================================================================
// Test: CRL generation from the database CA
// ============================================================================

#[tokio::test]
async fn test_crl_generation() {
    let t = test_authority().await;
    let crl = t.authority.issuance.generate_crl().await.unwrap();
    assert!(crl.contains("BEGIN X509 CRL"));
}

// ============================================================================
// Test: augmenting a session with device-trust extensions
// ============================================================================

#[tokio::test]
async fn test_augment_user_certs() {
    let t = test_authority().await;
    let (user, roles) = t
        .seed_user("alice", vec![role("access", &["alice"], Duration::from_secs(3600))])
        .await;

    let subject = ssh_keypair();
    let tls_key = rcgen::KeyPair::generate().unwrap();
    let mut req = CertRequest::new(
        user,
        roles,
        subject.public_key().to_openssh().unwrap(),
        Duration::from_secs(3600),
    );
    req.tls_public_key_pem = Some(tls_key.public_key_pem());
    let certs = t.authority.issuance.generate_user_certs(req).await.unwrap();
    let identity = Identity::from_pem_cert(certs.tls.as_deref().unwrap()).unwrap();

    let extensions = DeviceExtensions {
        device_id: "dev-1".to_string(),
        asset_tag: "tag-9".to_string(),
        credential_id: "cred-3".to_string(),
    };
    let augmented = t
        .authority
        .issuance
        .augment_user_certs(AugmentRequest {
            identity: identity.clone(),
            ssh_cert: certs.ssh.clone(),
            tls_public_key_pem: tls_key.public_key_pem(),
            device_extensions: extensions.clone(),
        })
        .await
        .unwrap();

    let ssh_cert = ssh_key::certificate::Certificate::from_openssh(&augmented.ssh).unwrap();
    assert_eq!(
        ssh_cert.extensions().get("device-id").map(String::as_str),
        Some("dev-1")
    );
    let augmented_identity =
        Identity::from_pem_cert(augmented.tls.as_deref().unwrap()).unwrap();
    assert_eq!(augmented_identity.device_extensions, Some(extensions));

    // A second augmentation is rejected
    let err = t
        .authority
        .issuance
        .augment_user_certs(AugmentRequest {
            identity: augmented_identity,
            ssh_cert: augmented.ssh,
            tls_public_key_pem: tls_key.public_key_pem(),
            device_extensions: DeviceExtensions {
                device_id: "dev-2".to_string(),
                asset_tag: String::new(),
                credential_id: String::new(),
            },
        })
        .await
        .unwrap_err();
    assert!(err.is_bad_parameter());
}

// ============================================================================
// Test: provision tokens and cluster alerts through the authority
// ============================================================================

#[tokio::test]
async fn test_provision_tokens_and_alerts() {
    let t = test_authority().await;

    assert_ok!(
        t.authority
            .tokens
            .create(ProvisionToken {
                name: "join-abc".to_string(),
                roles: vec!["node".to_string()],
                expires: Some(t.clock.now() + chrono::Duration::minutes(30)),
                labels: Labels::new(),
            })
            .await
    );
    assert_eq!(
        t.authority.tokens.get("join-abc").await.unwrap().roles,
        vec!["node".to_string()]
    );
    assert_ok!(t.authority.tokens.delete("join-abc").await);

    assert_ok!(
        t.authority
            .alerts
            .upsert(cluster_authority::alerts::ClusterAlert {
                id: "maintenance".to_string(),
                severity: cluster_authority::types::AlertSeverity::Medium,
                message: "maintenance window tonight".to_string(),
                labels: Labels::new(),
                expires: None,
            })
            .await
    );
    let visible = t
        .authority
        .alerts
        .visible(&["maintenance".to_string()])
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
}
