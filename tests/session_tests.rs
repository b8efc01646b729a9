//! Web session tests
//!
//! Session issuance caps, bearer token lifetimes, and the three extension
//! modes: reload, access-request elevation, and switchback.

mod common;

use common::{role, test_authority};
use cluster_authority::clock::Clock;
use cluster_authority::identity::Identity;
use cluster_authority::issuance::CertRequest;
use cluster_authority::session::{
    AccessRequest, ExtendMode, ExtendWebSessionRequest, NewWebSessionRequest,
};
use std::time::Duration;

async fn seeded(t: &common::TestAuthority) -> cluster_authority::roles::User {
    let (user, _) = t
        .seed_user(
            "alice",
            vec![role("access", &["alice"], Duration::from_secs(3600))],
        )
        .await;
    user
}

async fn new_session(
    t: &common::TestAuthority,
    user: &cluster_authority::roles::User,
) -> cluster_authority::session::WebSession {
    t.authority
        .sessions
        .new_web_session(NewWebSessionRequest {
            user: user.clone(),
            ttl: Duration::from_secs(12 * 3600),
            client_ip: None,
            mfa_verified: None,
            access_requests: Vec::new(),
        })
        .await
        .unwrap()
}

// ============================================================================
// Test: session and bearer TTLs are pinned to policy
// ============================================================================

#[tokio::test]
async fn test_new_session_ttls() {
    let t = test_authority().await;
    let user = seeded(&t).await;

    let session = new_session(&t, &user).await;

    // Requested 12 h; the role allows 1 h
    assert_eq!(session.expires, t.clock.now() + chrono::Duration::hours(1));
    // Bearer TTL = min(session TTL, 10 min)
    assert_eq!(
        session.bearer_expires,
        t.clock.now() + chrono::Duration::minutes(10)
    );
    assert_eq!(session.session_id.len(), 64);
    assert_eq!(session.bearer_token.len(), 64);
    assert_ne!(session.session_id, session.bearer_token);

    // Key accessors wrap the PEM and redact debug output
    let key = session.ssh_private_key();
    assert!(key.expose_secret().contains("OPENSSH PRIVATE KEY"));
    assert_eq!(format!("{key:?}"), "SecretString(***)");
    assert!(session
        .tls_private_key()
        .expose_secret()
        .contains("PRIVATE KEY"));

    // Both indexes resolve
    let loaded = t
        .authority
        .sessions
        .get_web_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(loaded.user, "alice");
    let token = t
        .authority
        .sessions
        .get_web_token(&session.bearer_token)
        .await
        .unwrap();
    assert_eq!(token.session_id, session.session_id);
}

// ============================================================================
// Test: reload preserves expiry and login time
// ============================================================================

#[tokio::test]
async fn test_extend_reload_preserves_window() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    let session = new_session(&t, &user).await;

    t.clock.advance(chrono::Duration::minutes(10));

    // Update the user's traits to prove reload sees fresh data
    let mut fresh = t.authority.users.get("alice").await.unwrap();
    fresh
        .traits
        .insert("team".to_string(), vec!["platform".to_string()]);
    t.authority.users.upsert(&fresh).await.unwrap();

    let extended = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id.clone(),
            mode: ExtendMode::Reload,
        })
        .await
        .unwrap();

    assert_eq!(extended.login_time, session.login_time);
    assert_eq!(extended.expires, session.expires);
    assert!(extended.expires <= session.expires);

    let identity =
        cluster_authority::identity::Identity::from_pem_cert(&extended.tls_cert).unwrap();
    assert_eq!(
        identity.traits.get("team"),
        Some(&vec!["platform".to_string()])
    );
}

// ============================================================================
// Test: access-request elevation merges roles and clamps expiry
// ============================================================================

#[tokio::test]
async fn test_extend_with_access_request() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    t.authority
        .roles
        .upsert(&role("db-admin", &["dba"], Duration::from_secs(8 * 3600)))
        .await
        .unwrap();

    let session = new_session(&t, &user).await;

    let access_expiry = t.clock.now() + chrono::Duration::minutes(30);
    t.authority
        .sessions
        .upsert_access_request(&AccessRequest {
            id: "req-1".to_string(),
            user: "alice".to_string(),
            roles: vec!["db-admin".to_string()],
            resource_ids: Vec::new(),
            approved: true,
            access_expiry,
        })
        .await
        .unwrap();

    let elevated = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id.clone(),
            mode: ExtendMode::AccessRequest {
                request_id: "req-1".to_string(),
            },
        })
        .await
        .unwrap();

    assert!(elevated.roles.contains(&"access".to_string()));
    assert!(elevated.roles.contains(&"db-admin".to_string()));
    // Expiry clamps to the request's window, which is shorter
    assert_eq!(elevated.expires, access_expiry);
    assert!(elevated.expires <= session.expires);
    assert_eq!(
        elevated.consumed_access_request_id.as_deref(),
        Some("req-1")
    );
    assert_eq!(elevated.login_time, session.login_time);
}

// ============================================================================
// Test: an elevated session's certificate cannot be used to reissue
// ============================================================================

#[tokio::test]
async fn test_elevated_session_cannot_reissue() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    t.authority
        .roles
        .upsert(&role("db-admin", &["dba"], Duration::from_secs(8 * 3600)))
        .await
        .unwrap();
    let session = new_session(&t, &user).await;

    t.authority
        .sessions
        .upsert_access_request(&AccessRequest {
            id: "req-reuse".to_string(),
            user: "alice".to_string(),
            roles: vec!["db-admin".to_string()],
            resource_ids: Vec::new(),
            approved: true,
            access_expiry: t.clock.now() + chrono::Duration::minutes(45),
        })
        .await
        .unwrap();

    let elevated = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id,
            mode: ExtendMode::AccessRequest {
                request_id: "req-reuse".to_string(),
            },
        })
        .await
        .unwrap();

    // The elevated certificate is stamped non-reissuable
    let identity = Identity::from_pem_cert(&elevated.tls_cert).unwrap();
    assert!(identity.disallow_reissue);
    assert_eq!(identity.active_requests, vec!["req-reuse".to_string()]);

    // Presenting that identity to request another elevated cert is denied
    let roles = t
        .authority
        .roles
        .resolve(&["access".to_string(), "db-admin".to_string()])
        .await
        .unwrap();
    let mut reuse = CertRequest::new(
        t.authority.users.get("alice").await.unwrap(),
        roles,
        common::ssh_public_key(),
        Duration::from_secs(600),
    );
    reuse.prev_identity = Some(identity);
    let err = t
        .authority
        .issuance
        .generate_user_certs(reuse)
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
}

#[tokio::test]
async fn test_unapproved_request_rejected() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    let session = new_session(&t, &user).await;

    t.authority
        .sessions
        .upsert_access_request(&AccessRequest {
            id: "req-2".to_string(),
            user: "alice".to_string(),
            roles: vec!["access".to_string()],
            resource_ids: Vec::new(),
            approved: false,
            access_expiry: t.clock.now() + chrono::Duration::hours(1),
        })
        .await
        .unwrap();

    let err = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id,
            mode: ExtendMode::AccessRequest {
                request_id: "req-2".to_string(),
            },
        })
        .await
        .unwrap_err();
    assert!(err.is_access_denied());
}

// ============================================================================
// Test: resource-scoped requests cannot stack
// ============================================================================

#[tokio::test]
async fn test_resource_requests_do_not_stack() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    t.authority
        .roles
        .upsert(&role("db-admin", &["dba"], Duration::from_secs(8 * 3600)))
        .await
        .unwrap();
    let session = new_session(&t, &user).await;

    for (id, resources) in [("res-1", vec!["node-1"]), ("res-2", vec!["node-2"])] {
        t.authority
            .sessions
            .upsert_access_request(&AccessRequest {
                id: id.to_string(),
                user: "alice".to_string(),
                roles: vec!["db-admin".to_string()],
                resource_ids: resources.iter().map(|s| s.to_string()).collect(),
                approved: true,
                access_expiry: t.clock.now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
    }

    let first = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id,
            mode: ExtendMode::AccessRequest {
                request_id: "res-1".to_string(),
            },
        })
        .await
        .unwrap();
    assert_eq!(first.resource_ids, vec!["node-1".to_string()]);

    let err = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: first.session_id,
            mode: ExtendMode::AccessRequest {
                request_id: "res-2".to_string(),
            },
        })
        .await
        .unwrap_err();
    assert!(err.is_bad_parameter());
}

// ============================================================================
// Test: switchback restores static roles and recomputes expiry
// ============================================================================

#[tokio::test]
async fn test_switchback() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    t.authority
        .roles
        .upsert(&role("db-admin", &["dba"], Duration::from_secs(8 * 3600)))
        .await
        .unwrap();
    let session = new_session(&t, &user).await;

    t.authority
        .sessions
        .upsert_access_request(&AccessRequest {
            id: "req-3".to_string(),
            user: "alice".to_string(),
            roles: vec!["db-admin".to_string()],
            resource_ids: Vec::new(),
            approved: true,
            access_expiry: t.clock.now() + chrono::Duration::minutes(45),
        })
        .await
        .unwrap();

    let elevated = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: session.session_id.clone(),
            mode: ExtendMode::AccessRequest {
                request_id: "req-3".to_string(),
            },
        })
        .await
        .unwrap();

    t.clock.advance(chrono::Duration::minutes(20));

    let switched = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "alice".to_string(),
            prev_session_id: elevated.session_id,
            mode: ExtendMode::Switchback,
        })
        .await
        .unwrap();

    assert_eq!(switched.roles, vec!["access".to_string()]);
    assert!(switched.resource_ids.is_empty());
    assert!(switched.consumed_access_request_id.is_none());
    // Switchback expiry = original login time + static role max TTL
    assert_eq!(
        switched.expires,
        session.login_time + chrono::Duration::hours(1)
    );
    assert_eq!(switched.login_time, session.login_time);
}

// ============================================================================
// Test: ownership and bulk deletion
// ============================================================================

#[tokio::test]
async fn test_session_ownership_and_bulk_delete() {
    let t = test_authority().await;
    let user = seeded(&t).await;
    let session = new_session(&t, &user).await;

    let err = t
        .authority
        .sessions
        .extend_web_session(ExtendWebSessionRequest {
            user: "mallory".to_string(),
            prev_session_id: session.session_id.clone(),
            mode: ExtendMode::Reload,
        })
        .await
        .unwrap_err();
    assert!(err.is_access_denied());

    let second = new_session(&t, &user).await;
    t.authority
        .sessions
        .delete_all_user_sessions("alice")
        .await
        .unwrap();
    for sid in [&session.session_id, &second.session_id] {
        assert!(t
            .authority
            .sessions
            .get_web_session(sid)
            .await
            .unwrap_err()
            .is_not_found());
    }
    assert!(t
        .authority
        .sessions
        .get_web_token(&session.bearer_token)
        .await
        .unwrap_err()
        .is_not_found());
}
