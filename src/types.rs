//! Common types used throughout the cluster authority

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Arbitrary key/value labels attached to resources
pub type Labels = BTreeMap<String, String>;

/// Synthetic principal appended to every issued user certificate so that
/// session-join RBAC works even for users with no interactive logins
pub const JOIN_ONLY_PRINCIPAL: &str = "-teleport-join-only";

/// Well-known cluster alert ID for upgrade suggestions
pub const ALERT_UPGRADE_SUGGESTION: &str = "upgrade-suggestion";

/// Well-known cluster alert ID for available security patches.
/// Supersedes [`ALERT_UPGRADE_SUGGESTION`] for recipients authorized for both.
pub const ALERT_SECURITY_PATCH: &str = "security-patch-available";

/// Maximum length of an MFA device name
pub const MAX_DEVICE_NAME_LEN: usize = 30;

/// Certificate authority types, one signing entity per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertAuthType {
    /// Signs user SSH and TLS certificates
    User,
    /// Signs host SSH and TLS certificates
    Host,
    /// Signs database access certificates
    Database,
    /// Signs SSH certificates for registered OpenSSH servers
    OpenSsh,
    /// Signs JWT tokens for application access
    Jwt,
    /// Signs artifacts for the cluster acting as an OIDC provider
    OidcIdp,
    /// Signs artifacts for the cluster acting as a SAML provider
    SamlIdp,
}

impl CertAuthType {
    /// All CA types, in a stable order
    pub const ALL: [CertAuthType; 7] = [
        CertAuthType::User,
        CertAuthType::Host,
        CertAuthType::Database,
        CertAuthType::OpenSsh,
        CertAuthType::Jwt,
        CertAuthType::OidcIdp,
        CertAuthType::SamlIdp,
    ];

    /// Whether a CA of this type carries SSH keypairs
    pub fn has_ssh_keys(&self) -> bool {
        matches!(self, Self::User | Self::Host | Self::OpenSsh)
    }

    /// Whether a CA of this type carries TLS keypairs
    pub fn has_tls_keys(&self) -> bool {
        matches!(self, Self::User | Self::Host | Self::Database | Self::SamlIdp)
    }

    /// Whether a CA of this type carries JWT keypairs
    pub fn has_jwt_keys(&self) -> bool {
        matches!(self, Self::Jwt | Self::OidcIdp)
    }
}

impl fmt::Display for CertAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Host => "host",
            Self::Database => "database",
            Self::OpenSsh => "openssh",
            Self::Jwt => "jwt",
            Self::OidcIdp => "oidc_idp",
            Self::SamlIdp => "saml_idp",
        };
        write!(f, "{s}")
    }
}

/// Cluster-wide second factor policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecondFactorPolicy {
    /// Second factors disabled
    Off,
    /// Any second factor may be enrolled but none is required
    #[default]
    Optional,
    /// At least one second factor of any kind is required
    On,
    /// A TOTP device is required
    Otp,
    /// A WebAuthn device is required
    Webauthn,
}

impl SecondFactorPolicy {
    /// Whether TOTP devices may be enrolled under this policy
    pub fn allows_totp(&self) -> bool {
        matches!(self, Self::Optional | Self::On | Self::Otp)
    }

    /// Whether WebAuthn devices may be enrolled under this policy
    pub fn allows_webauthn(&self) -> bool {
        matches!(self, Self::Optional | Self::On | Self::Webauthn)
    }
}

/// Private key policy a certificate subject must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PrivateKeyPolicy {
    /// No restriction on where the private key lives
    #[default]
    None,
    /// Key must reside in a hardware token
    HardwareKey,
    /// Key must reside in a hardware token requiring touch per operation
    HardwareKeyTouch,
}

impl PrivateKeyPolicy {
    /// The stricter of two policies
    pub fn strictest(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether a key attested at `attested` satisfies this policy
    pub fn is_satisfied_by(&self, attested: PrivateKeyPolicy) -> bool {
        attested >= *self
    }

    /// Wire representation used in certificate extensions
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::HardwareKey => "hardware_key",
            Self::HardwareKeyTouch => "hardware_key_touch",
        }
    }

    /// Parse the wire representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "hardware_key" => Some(Self::HardwareKey),
            "hardware_key_touch" => Some(Self::HardwareKeyTouch),
            _ => None,
        }
    }
}

/// SSH certificate format requested by a role set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFormat {
    /// Full extension set
    #[default]
    Standard,
    /// Compatibility format for plain OpenSSH servers: only standard
    /// permit-* extensions are emitted
    OldSsh,
}

/// Kind of user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Created and stored by this cluster
    #[default]
    Local,
    /// Provisioned from an external identity provider
    Sso,
}

impl UserType {
    /// Wire representation used in the X.509 subject
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sso => "sso",
        }
    }

    /// Parse the wire representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "sso" => Some(Self::Sso),
            _ => None,
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational
    Low,
    /// Should be acted on soon
    Medium,
    /// Requires immediate attention
    High,
}

/// Secret string with redacted debug output and secure memory handling
#[derive(Clone)]
pub struct SecretString(secrecy::SecretString);

impl SecretString {
    /// Create a new secret string
    pub fn new(s: String) -> Self {
        Self(secrecy::SecretString::from(s))
    }

    /// Get the inner secret
    pub fn expose_secret(&self) -> &str {
        use secrecy::ExposeSecret;
        self.0.expose_secret()
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(***)")
    }
}

/// Form an auth-cluster host identifier: `"<hostUUID>.<clusterName>"`
pub fn host_fqdn(host_id: Uuid, cluster_name: &str) -> String {
    format!("{host_id}.{cluster_name}")
}

/// Extract the host UUID from an identifier by stripping the cluster suffix.
///
/// Returns the input unchanged when it does not carry the suffix, so bare
/// UUIDs pass through.
pub fn strip_host_suffix<'a>(host_id: &'a str, cluster_name: &str) -> &'a str {
    host_id
        .strip_suffix(&format!(".{cluster_name}"))
        .unwrap_or(host_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_set_shapes() {
        assert!(CertAuthType::User.has_ssh_keys() && CertAuthType::User.has_tls_keys());
        assert!(!CertAuthType::User.has_jwt_keys());
        assert!(CertAuthType::Database.has_tls_keys() && !CertAuthType::Database.has_ssh_keys());
        assert!(CertAuthType::OpenSsh.has_ssh_keys() && !CertAuthType::OpenSsh.has_tls_keys());
        assert!(CertAuthType::Jwt.has_jwt_keys() && !CertAuthType::Jwt.has_tls_keys());
        assert!(CertAuthType::SamlIdp.has_tls_keys());
    }

    #[test]
    fn test_private_key_policy_ordering() {
        use PrivateKeyPolicy::*;
        assert_eq!(None.strictest(HardwareKey), HardwareKey);
        assert_eq!(HardwareKeyTouch.strictest(HardwareKey), HardwareKeyTouch);
        assert!(HardwareKey.is_satisfied_by(HardwareKeyTouch));
        assert!(!HardwareKeyTouch.is_satisfied_by(HardwareKey));
        assert!(None.is_satisfied_by(None));
    }

    #[test]
    fn test_host_naming_round_trip() {
        let id = Uuid::new_v4();
        let fqdn = host_fqdn(id, "example.com");
        assert_eq!(strip_host_suffix(&fqdn, "example.com"), id.to_string());
        // Bare UUIDs pass through unchanged
        assert_eq!(
            strip_host_suffix(&id.to_string(), "example.com"),
            id.to_string()
        );
    }
}
