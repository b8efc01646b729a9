//! Error types for cluster authority operations

use thiserror::Error;

/// Result type alias for authority operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Main error type for the cluster authority core
///
/// The first eight variants are the transport-agnostic error kinds that every
/// layer preserves; the remainder wrap library errors encountered along the
/// way. Layers annotate errors but never replace the kind, with two
/// deliberate exceptions: remote-cluster access denials are masked to
/// [`AuthError::NotFound`] to prevent enumeration, and unknown users during
/// authentication still run a guaranteed-to-fail verification to avoid
/// timing oracles.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed request; never retry
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Authorization, lock, or MFA failure
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Resource missing (or access denial masked to hide existence)
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation collided with an existing record
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency loss; caller retries
    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// Throttling or retry exhaustion
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Transient backend issue; not counted against login attempts
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// Feature requires a build or license this instance lacks
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// SSH key errors
    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    /// Certificate generation errors
    #[error("certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    /// X.509 parsing errors
    #[error("X.509 error: {0}")]
    X509(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Base64 decoding errors
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// PEM parsing errors
    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Construct a `BadParameter` error
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Construct an `AccessDenied` error
    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    /// Construct a `NotFound` error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Construct an `AlreadyExists` error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Construct a `CompareFailed` error
    pub fn compare_failed(msg: impl Into<String>) -> Self {
        Self::CompareFailed(msg.into())
    }

    /// Construct a `LimitExceeded` error
    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    /// Construct a `ConnectionProblem` error
    pub fn connection_problem(msg: impl Into<String>) -> Self {
        Self::ConnectionProblem(msg.into())
    }

    /// Construct a `NotImplemented` error
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// True if this is a `BadParameter` error
    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Self::BadParameter(_))
    }

    /// True if this is an `AccessDenied` error
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    /// True if this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True if this is an `AlreadyExists` error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// True if this is a `CompareFailed` error
    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Self::CompareFailed(_))
    }

    /// True if this is a `LimitExceeded` error
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::LimitExceeded(_))
    }

    /// True if this is a `ConnectionProblem` error
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, Self::ConnectionProblem(_))
    }

    /// True if this is a `NotImplemented` error
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }
}
