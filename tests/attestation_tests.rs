//! Attestation capability tests
//!
//! The pipeline must demand an attestation whenever the effective private
//! key policy is stricter than none, bind the attested policy into the
//! certificates, and deny anything the capability refutes.

mod common;

use async_trait::async_trait;
use cluster_authority::authority::AuthorityBuilder;
use cluster_authority::config::AuthConfig;
use cluster_authority::identity::Identity;
use cluster_authority::issuance::{AttestationStatement, Attestor, CertRequest};
use cluster_authority::types::PrivateKeyPolicy;
use cluster_authority::Result;
use common::{role, ssh_keypair};
use mockall::mock;
use mockall::predicate::always;
use std::sync::Arc;
use std::time::Duration;

mock! {
    HardwareAttestor {}

    #[async_trait]
    impl Attestor for HardwareAttestor {
        async fn verify(
            &self,
            statement: &AttestationStatement,
            public_key: &str,
        ) -> Result<PrivateKeyPolicy>;
    }
}

async fn attesting_authority(
    attestor: Arc<dyn Attestor>,
) -> common::TestAuthority {
    let clock = Arc::new(cluster_authority::clock::ManualClock::default());
    let backend = Arc::new(cluster_authority::backend::MemoryBackend::new(clock.clone()));
    let emitter = Arc::new(cluster_authority::events::RecordingEmitter::new());

    let config = AuthConfig {
        cluster_name: "example.com".to_string(),
        private_key_policy: PrivateKeyPolicy::HardwareKey,
        ..Default::default()
    };
    let authority = Arc::new(
        AuthorityBuilder::new(config, backend.clone(), clock.clone())
            .emitter(emitter.clone())
            .attestor(attestor)
            .build(),
    );
    authority.bootstrap().await.unwrap();

    common::TestAuthority {
        authority,
        clock,
        backend,
        emitter,
    }
}

// ============================================================================
// Test: a strict policy without a statement is denied outright
// ============================================================================

#[tokio::test]
async fn test_missing_attestation_denied() {
    let mut attestor = MockHardwareAttestor::new();
    attestor.expect_verify().never();
    let t = attesting_authority(Arc::new(attestor)).await;

    let (user, roles) = t
        .seed_user("kate", vec![role("access", &["kate"], Duration::from_secs(3600))])
        .await;

    let err = t
        .authority
        .issuance
        .generate_user_certs(CertRequest::new(
            user,
            roles,
            common::ssh_public_key(),
            Duration::from_secs(600),
        ))
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
}

// ============================================================================
// Test: a verified statement binds the attested policy into the certs
// ============================================================================

#[tokio::test]
async fn test_attested_policy_bound_into_certs() {
    let mut attestor = MockHardwareAttestor::new();
    attestor
        .expect_verify()
        .with(always(), always())
        .returning(|_, _| Ok(PrivateKeyPolicy::HardwareKeyTouch));
    let t = attesting_authority(Arc::new(attestor)).await;

    let (user, roles) = t
        .seed_user("kate", vec![role("access", &["kate"], Duration::from_secs(3600))])
        .await;

    let subject = ssh_keypair();
    let tls_key = rcgen::KeyPair::generate().unwrap();
    let mut req = CertRequest::new(
        user,
        roles,
        subject.public_key().to_openssh().unwrap(),
        Duration::from_secs(600),
    );
    req.tls_public_key_pem = Some(tls_key.public_key_pem());
    req.attestation = Some(AttestationStatement {
        public_key: subject.public_key().to_openssh().unwrap(),
        data: vec![1, 2, 3],
    });

    let certs = t.authority.issuance.generate_user_certs(req).await.unwrap();

    let ssh_cert = ssh_key::certificate::Certificate::from_openssh(&certs.ssh).unwrap();
    assert_eq!(
        ssh_cert
            .extensions()
            .get("private-key-policy")
            .map(String::as_str),
        Some("hardware_key_touch")
    );
    let identity = Identity::from_pem_cert(certs.tls.as_deref().unwrap()).unwrap();
    assert_eq!(identity.private_key_policy, PrivateKeyPolicy::HardwareKeyTouch);
}

// ============================================================================
// Test: an attested policy weaker than required is denied
// ============================================================================

#[tokio::test]
async fn test_insufficient_attested_policy_denied() {
    let mut attestor = MockHardwareAttestor::new();
    attestor
        .expect_verify()
        .returning(|_, _| Ok(PrivateKeyPolicy::None));
    let t = attesting_authority(Arc::new(attestor)).await;

    let (user, roles) = t
        .seed_user("kate", vec![role("access", &["kate"], Duration::from_secs(3600))])
        .await;

    let subject = ssh_keypair();
    let mut req = CertRequest::new(
        user,
        roles,
        subject.public_key().to_openssh().unwrap(),
        Duration::from_secs(600),
    );
    req.attestation = Some(AttestationStatement {
        public_key: subject.public_key().to_openssh().unwrap(),
        data: vec![],
    });

    let err = t
        .authority
        .issuance
        .generate_user_certs(req)
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
}
