//! TLS certificate identity
//!
//! [`Identity`] is the canonical subject of a TLS certificate issued by the
//! user CA. It is encoded into the X.509 subject through a private OID arc
//! and decoded back without loss: the mapping is bijective, so a certificate
//! alone reconstructs the identity that produced it.

use crate::types::{PrivateKeyPolicy, UserType};
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use rcgen::{DistinguishedName, DnType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use x509_parser::prelude::*;

/// Private enterprise arc carrying identity attributes in the subject
const OID_ARC: [u64; 7] = [1, 3, 6, 1, 4, 1, 57305];

const OID_SUFFIX_PRINCIPALS: u64 = 1;
const OID_SUFFIX_ROLES: u64 = 2;
const OID_SUFFIX_TRAITS: u64 = 3;
const OID_SUFFIX_ROUTE_CLUSTER: u64 = 4;
const OID_SUFFIX_KUBE_CLUSTER: u64 = 5;
const OID_SUFFIX_ROUTE_DATABASE: u64 = 6;
const OID_SUFFIX_ROUTE_APP: u64 = 7;
const OID_SUFFIX_MFA_VERIFIED: u64 = 8;
const OID_SUFFIX_PREV_IDENTITY_EXPIRES: u64 = 9;
const OID_SUFFIX_LOGIN_IP: u64 = 10;
const OID_SUFFIX_PINNED_IP: u64 = 11;
const OID_SUFFIX_ACTIVE_REQUESTS: u64 = 12;
const OID_SUFFIX_KEY_POLICY: u64 = 13;
const OID_SUFFIX_DEVICE_ID: u64 = 14;
const OID_SUFFIX_DEVICE_ASSET_TAG: u64 = 15;
const OID_SUFFIX_DEVICE_CREDENTIAL_ID: u64 = 16;
const OID_SUFFIX_IMPERSONATOR: u64 = 17;
const OID_SUFFIX_USER_TYPE: u64 = 18;
const OID_SUFFIX_DISALLOW_REISSUE: u64 = 19;

const OID_COMMON_NAME: &str = "2.5.4.3";

/// Database routing carried inside a database-access certificate
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteToDatabase {
    /// Name of the registered database service
    pub service_name: String,
    /// Database wire protocol, e.g. `postgres`, `mysql`, `mongodb`
    pub protocol: String,
    /// Database-level user to connect as
    pub username: String,
    /// Database name to connect to
    pub database: String,
}

/// Trusted-device attributes bound into certificates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceExtensions {
    /// Device inventory identifier
    pub device_id: String,
    /// Device asset tag
    pub asset_tag: String,
    /// Device credential identifier
    pub credential_id: String,
}

impl DeviceExtensions {
    /// Whether all attributes are empty
    pub fn is_empty(&self) -> bool {
        self.device_id.is_empty() && self.asset_tag.is_empty() && self.credential_id.is_empty()
    }
}

/// The canonical subject of a TLS certificate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated username
    pub username: String,
    /// User who requested the certificate on behalf of `username`, if any
    pub impersonator: Option<String>,
    /// Allowed SSH principals
    pub principals: Vec<String>,
    /// Role names in effect
    pub roles: Vec<String>,
    /// External traits
    pub traits: BTreeMap<String, Vec<String>>,
    /// Target cluster for cross-cluster routing
    pub route_to_cluster: Option<String>,
    /// Target Kubernetes cluster
    pub kubernetes_cluster: Option<String>,
    /// Target database
    pub route_to_database: Option<RouteToDatabase>,
    /// Target application
    pub route_to_app: Option<String>,
    /// ID of the MFA device that verified this issuance, if any
    pub mfa_verified: Option<String>,
    /// Expiry of the identity this one was derived from, for reissue chains
    pub previous_identity_expires: Option<DateTime<Utc>>,
    /// Observed client IP at login
    pub login_ip: Option<String>,
    /// IP this certificate is pinned to; connections from elsewhere fail
    pub pinned_ip: Option<String>,
    /// Active access-request IDs consumed by this certificate
    pub active_requests: Vec<String>,
    /// Private key policy the subject key satisfied
    pub private_key_policy: PrivateKeyPolicy,
    /// Trusted-device attributes, absent unless device trust verified
    pub device_extensions: Option<DeviceExtensions>,
    /// Local or SSO account
    pub user_type: UserType,
    /// Whether the holder is forbidden from requesting new certificates
    pub disallow_reissue: bool,
}

fn oid(suffix: u64) -> Vec<u64> {
    let mut v = OID_ARC.to_vec();
    v.push(suffix);
    v
}

fn oid_string(suffix: u64) -> String {
    oid(suffix)
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

impl Identity {
    /// Encode this identity as an X.509 distinguished name.
    ///
    /// Empty collections and `None` fields are omitted entirely; decoding an
    /// absent attribute restores the empty value, which is what makes the
    /// mapping bijective.
    pub fn to_distinguished_name(&self) -> Result<DistinguishedName> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.username.clone());

        let mut push = |suffix: u64, value: String| {
            dn.push(DnType::CustomDnType(oid(suffix)), value);
        };

        if !self.principals.is_empty() {
            push(OID_SUFFIX_PRINCIPALS, serde_json::to_string(&self.principals)?);
        }
        if !self.roles.is_empty() {
            push(OID_SUFFIX_ROLES, serde_json::to_string(&self.roles)?);
        }
        if !self.traits.is_empty() {
            push(OID_SUFFIX_TRAITS, serde_json::to_string(&self.traits)?);
        }
        if let Some(cluster) = &self.route_to_cluster {
            push(OID_SUFFIX_ROUTE_CLUSTER, cluster.clone());
        }
        if let Some(kube) = &self.kubernetes_cluster {
            push(OID_SUFFIX_KUBE_CLUSTER, kube.clone());
        }
        if let Some(db) = &self.route_to_database {
            push(OID_SUFFIX_ROUTE_DATABASE, serde_json::to_string(db)?);
        }
        if let Some(app) = &self.route_to_app {
            push(OID_SUFFIX_ROUTE_APP, app.clone());
        }
        if let Some(device) = &self.mfa_verified {
            push(OID_SUFFIX_MFA_VERIFIED, device.clone());
        }
        if let Some(expires) = self.previous_identity_expires {
            push(OID_SUFFIX_PREV_IDENTITY_EXPIRES, expires.timestamp().to_string());
        }
        if let Some(ip) = &self.login_ip {
            push(OID_SUFFIX_LOGIN_IP, ip.clone());
        }
        if let Some(ip) = &self.pinned_ip {
            push(OID_SUFFIX_PINNED_IP, ip.clone());
        }
        if !self.active_requests.is_empty() {
            push(
                OID_SUFFIX_ACTIVE_REQUESTS,
                serde_json::to_string(&self.active_requests)?,
            );
        }
        if self.private_key_policy != PrivateKeyPolicy::None {
            push(
                OID_SUFFIX_KEY_POLICY,
                self.private_key_policy.as_str().to_string(),
            );
        }
        if let Some(device) = &self.device_extensions {
            if !device.device_id.is_empty() {
                push(OID_SUFFIX_DEVICE_ID, device.device_id.clone());
            }
            if !device.asset_tag.is_empty() {
                push(OID_SUFFIX_DEVICE_ASSET_TAG, device.asset_tag.clone());
            }
            if !device.credential_id.is_empty() {
                push(OID_SUFFIX_DEVICE_CREDENTIAL_ID, device.credential_id.clone());
            }
        }
        if let Some(impersonator) = &self.impersonator {
            push(OID_SUFFIX_IMPERSONATOR, impersonator.clone());
        }
        if self.user_type != UserType::Local {
            push(OID_SUFFIX_USER_TYPE, self.user_type.as_str().to_string());
        }
        if self.disallow_reissue {
            push(OID_SUFFIX_DISALLOW_REISSUE, "true".to_string());
        }

        Ok(dn)
    }

    /// Decode an identity from a parsed X.509 subject
    pub fn from_x509_name(name: &X509Name<'_>) -> Result<Self> {
        let mut identity = Identity::default();
        let mut device = DeviceExtensions::default();

        for attr in name.iter_attributes() {
            let oid_str = attr.attr_type().to_id_string();
            let value = attr
                .as_str()
                .map_err(|e| AuthError::X509(format!("bad subject attribute: {e}")))?
                .to_string();

            if oid_str == OID_COMMON_NAME {
                identity.username = value;
                continue;
            }

            match oid_str {
                s if s == oid_string(OID_SUFFIX_PRINCIPALS) => {
                    identity.principals = serde_json::from_str(&value)?;
                }
                s if s == oid_string(OID_SUFFIX_ROLES) => {
                    identity.roles = serde_json::from_str(&value)?;
                }
                s if s == oid_string(OID_SUFFIX_TRAITS) => {
                    identity.traits = serde_json::from_str(&value)?;
                }
                s if s == oid_string(OID_SUFFIX_ROUTE_CLUSTER) => {
                    identity.route_to_cluster = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_KUBE_CLUSTER) => {
                    identity.kubernetes_cluster = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_ROUTE_DATABASE) => {
                    identity.route_to_database = Some(serde_json::from_str(&value)?);
                }
                s if s == oid_string(OID_SUFFIX_ROUTE_APP) => {
                    identity.route_to_app = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_MFA_VERIFIED) => {
                    identity.mfa_verified = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_PREV_IDENTITY_EXPIRES) => {
                    let secs: i64 = value
                        .parse()
                        .map_err(|_| AuthError::X509(format!("bad expiry timestamp {value:?}")))?;
                    identity.previous_identity_expires = DateTime::from_timestamp(secs, 0);
                }
                s if s == oid_string(OID_SUFFIX_LOGIN_IP) => {
                    identity.login_ip = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_PINNED_IP) => {
                    identity.pinned_ip = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_ACTIVE_REQUESTS) => {
                    identity.active_requests = serde_json::from_str(&value)?;
                }
                s if s == oid_string(OID_SUFFIX_KEY_POLICY) => {
                    identity.private_key_policy = PrivateKeyPolicy::parse(&value)
                        .ok_or_else(|| AuthError::X509(format!("bad key policy {value:?}")))?;
                }
                s if s == oid_string(OID_SUFFIX_DEVICE_ID) => {
                    device.device_id = value;
                }
                s if s == oid_string(OID_SUFFIX_DEVICE_ASSET_TAG) => {
                    device.asset_tag = value;
                }
                s if s == oid_string(OID_SUFFIX_DEVICE_CREDENTIAL_ID) => {
                    device.credential_id = value;
                }
                s if s == oid_string(OID_SUFFIX_IMPERSONATOR) => {
                    identity.impersonator = Some(value);
                }
                s if s == oid_string(OID_SUFFIX_USER_TYPE) => {
                    identity.user_type = UserType::parse(&value)
                        .ok_or_else(|| AuthError::X509(format!("bad user type {value:?}")))?;
                }
                s if s == oid_string(OID_SUFFIX_DISALLOW_REISSUE) => {
                    identity.disallow_reissue = value == "true";
                }
                // Foreign attributes are tolerated and ignored
                _ => {}
            }
        }

        if !device.is_empty() {
            identity.device_extensions = Some(device);
        }

        Ok(identity)
    }

    /// Decode an identity from a PEM-encoded certificate's subject
    pub fn from_pem_cert(cert_pem: &str) -> Result<Self> {
        let (_, doc) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| AuthError::X509(format!("bad PEM certificate: {e}")))?;
        let cert = doc
            .parse_x509()
            .map_err(|e| AuthError::X509(format!("bad X.509 certificate: {e}")))?;
        Self::from_x509_name(cert.subject())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> Identity {
        let mut traits = BTreeMap::new();
        traits.insert("logins".to_string(), vec!["admin".to_string()]);
        Identity {
            username: "alice".to_string(),
            impersonator: Some("bot".to_string()),
            principals: vec!["admin".to_string(), "ops".to_string()],
            roles: vec!["access".to_string()],
            traits,
            route_to_cluster: Some("leaf.example.com".to_string()),
            kubernetes_cluster: None,
            route_to_database: Some(RouteToDatabase {
                service_name: "pg".to_string(),
                protocol: "postgres".to_string(),
                username: "alice".to_string(),
                database: "main".to_string(),
            }),
            route_to_app: None,
            mfa_verified: Some("device-1".to_string()),
            previous_identity_expires: DateTime::from_timestamp(1_700_000_000, 0),
            login_ip: Some("198.51.100.7".to_string()),
            pinned_ip: None,
            active_requests: vec!["req-1".to_string()],
            private_key_policy: PrivateKeyPolicy::HardwareKey,
            device_extensions: Some(DeviceExtensions {
                device_id: "dev-1".to_string(),
                asset_tag: "tag-9".to_string(),
                credential_id: "cred-3".to_string(),
            }),
            user_type: UserType::Sso,
            disallow_reissue: true,
        }
    }

    #[test]
    fn test_subject_round_trip() {
        let identity = sample_identity();
        let dn = identity.to_distinguished_name().unwrap();

        // Mint a throwaway self-signed cert carrying the subject, then parse
        // it back out
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = dn;
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let decoded = Identity::from_pem_cert(&cert.pem()).unwrap();
        assert_eq!(decoded, identity);
    }

    #[test]
    fn test_empty_fields_stay_empty() {
        let identity = Identity {
            username: "bob".to_string(),
            ..Default::default()
        };
        let dn = identity.to_distinguished_name().unwrap();

        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = dn;
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let decoded = Identity::from_pem_cert(&cert.pem()).unwrap();
        assert_eq!(decoded, identity);
        assert!(decoded.device_extensions.is_none());
        assert_eq!(decoded.private_key_policy, PrivateKeyPolicy::None);
        assert_eq!(decoded.user_type, UserType::Local);
    }
}
