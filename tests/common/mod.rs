//! Shared test harness
//!
//! Builds a fully wired authority over the in-memory backend with a manual
//! clock and a recording audit emitter, plus helpers for seeding roles,
//! users, and keypairs.

#![allow(dead_code)]

use cluster_authority::authority::{Authority, AuthorityBuilder};
use cluster_authority::backend::MemoryBackend;
use cluster_authority::clock::{Clock, ManualClock};
use cluster_authority::config::AuthConfig;
use cluster_authority::events::RecordingEmitter;
use cluster_authority::roles::{Role, RoleSet, User};
use rand::rngs::OsRng;
use ssh_key::{Algorithm, PrivateKey};
use std::sync::Arc;
use std::time::Duration;

pub struct TestAuthority {
    pub authority: Arc<Authority>,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MemoryBackend>,
    pub emitter: Arc<RecordingEmitter>,
}

pub async fn test_authority() -> TestAuthority {
    test_authority_with(|_| {}).await
}

pub async fn test_authority_with(mutate: impl FnOnce(&mut AuthConfig)) -> TestAuthority {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let emitter = Arc::new(RecordingEmitter::new());

    let mut config = AuthConfig {
        cluster_name: "example.com".to_string(),
        ..Default::default()
    };
    mutate(&mut config);
    config.validate().unwrap();

    let authority = Arc::new(
        AuthorityBuilder::new(config, backend.clone(), clock.clone())
            .emitter(emitter.clone())
            .build(),
    );
    authority.bootstrap().await.unwrap();

    TestAuthority {
        authority,
        clock,
        backend,
        emitter,
    }
}

pub fn role(name: &str, logins: &[&str], max_ttl: Duration) -> Role {
    Role::new(
        name,
        logins.iter().map(|s| s.to_string()).collect(),
        max_ttl,
    )
}

impl TestAuthority {
    /// Store the given roles and a user holding them
    pub async fn seed_user(&self, name: &str, roles: Vec<Role>) -> (User, RoleSet) {
        for r in &roles {
            self.authority.roles.upsert(r).await.unwrap();
        }
        let user = User::new(
            name,
            roles.iter().map(|r| r.name.clone()).collect(),
            self.clock.now(),
        );
        self.authority.users.create(&user).await.unwrap();
        (
            self.authority.users.get(name).await.unwrap(),
            RoleSet::new(roles),
        )
    }
}

pub fn ssh_keypair() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

pub fn ssh_public_key() -> String {
    ssh_keypair().public_key().to_openssh().unwrap()
}
