//! Identity subject-encoding law
//!
//! Encoding an identity into an X.509 subject and decoding it back must
//! yield the original identity, for arbitrary identities.

use cluster_authority::identity::{DeviceExtensions, Identity, RouteToDatabase};
use cluster_authority::types::{PrivateKeyPolicy, UserType};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,11}"
}

fn opt_name() -> impl Strategy<Value = Option<String>> {
    proptest::option::of(name_strategy())
}

fn names(max: usize) -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(name_strategy(), 0..max)
}

fn traits_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<String>>> {
    proptest::collection::btree_map(name_strategy(), names(3), 0..3)
}

fn device_strategy() -> impl Strategy<Value = Option<DeviceExtensions>> {
    proptest::option::of(
        (name_strategy(), name_strategy(), name_strategy()).prop_map(
            |(device_id, asset_tag, credential_id)| DeviceExtensions {
                device_id,
                asset_tag,
                credential_id,
            },
        ),
    )
}

fn database_strategy() -> impl Strategy<Value = Option<RouteToDatabase>> {
    proptest::option::of((name_strategy(), name_strategy(), name_strategy()).prop_map(
        |(service_name, username, database)| RouteToDatabase {
            service_name,
            protocol: "postgres".to_string(),
            username,
            database,
        },
    ))
}

fn identity_strategy() -> impl Strategy<Value = Identity> {
    // Tuples above proptest's 10-element limit get unwieldy; build in two
    // halves
    let routing = (
        opt_name(),
        opt_name(),
        database_strategy(),
        opt_name(),
        opt_name(),
        proptest::option::of(0i64..=4_000_000_000i64),
    );
    let attributes = (
        name_strategy(),
        opt_name(),
        names(4),
        names(4),
        traits_strategy(),
        names(3),
        prop_oneof![
            Just(PrivateKeyPolicy::None),
            Just(PrivateKeyPolicy::HardwareKey),
            Just(PrivateKeyPolicy::HardwareKeyTouch),
        ],
        device_strategy(),
        prop_oneof![Just(UserType::Local), Just(UserType::Sso)],
        any::<bool>(),
    );
    let ips = (opt_name(), opt_name(), opt_name());

    (routing, attributes, ips).prop_map(
        |(
            (route_to_cluster, kubernetes_cluster, route_to_database, route_to_app, mfa_verified, prev_expiry),
            (
                username,
                impersonator,
                principals,
                roles,
                traits,
                active_requests,
                private_key_policy,
                device_extensions,
                user_type,
                disallow_reissue,
            ),
            (login_ip, pinned_ip, _),
        )| Identity {
            username,
            impersonator,
            principals,
            roles,
            traits,
            route_to_cluster,
            kubernetes_cluster,
            route_to_database,
            route_to_app,
            mfa_verified,
            previous_identity_expires: prev_expiry
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
            login_ip,
            pinned_ip,
            active_requests,
            private_key_policy,
            device_extensions,
            user_type,
            disallow_reissue,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn identity_subject_encoding_is_bijective(identity in identity_strategy()) {
        let dn = identity.to_distinguished_name().unwrap();

        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = dn;
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let decoded = Identity::from_pem_cert(&cert.pem()).unwrap();

        // Fully empty device extensions decode as absent
        let mut expected = identity;
        if expected
            .device_extensions
            .as_ref()
            .is_some_and(|d| d.is_empty())
        {
            expected.device_extensions = None;
        }
        prop_assert_eq!(decoded, expected);
    }
}
