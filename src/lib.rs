//! # Cluster Authority - Certificate Issuance and Access Control Core
//!
//! This crate is the server-side core of a cluster certificate authority:
//! it issues short-lived SSH, X.509, and JWT credentials to users and
//! infrastructure nodes, governs multi-factor enrollment and challenge,
//! enforces lock-based revocation at issuance time, and rotates its own
//! signing keys online.
//!
//! ## Architecture
//!
//! The issuance pipeline is the hub: it consults the lock watcher, draws
//! signers from the keystore, and mints the joint SSH + TLS bundle. Around
//! it sit:
//! - `keystore`: CA private keys across software, HSM, and KMS backings
//! - `ca` / `lifecycle`: certificate authority records, rotation, key GC
//! - `ssh` / `tls` / `jwt`: the three artifact formats
//! - `identity`: the bijective X.509-subject encoding of a certificate's
//!   identity
//! - `mfa`: TOTP and WebAuthn enrollment, challenge, safe deletion
//! - `session`: web session issuance and renewal
//! - `lock`: in-memory view of in-force locks
//! - `inventory`: per-agent bidirectional control streams
//! - `backend`: the revisioned key/value seam everything persists through
//!
//! External identity providers, resource discovery, and transport framing
//! are out of scope; they meet this crate at trait seams.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alerts;
pub mod authority;
pub mod backend;
pub mod ca;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod headless;
pub mod identity;
pub mod inventory;
pub mod issuance;
pub mod jwt;
pub mod keystore;
pub mod lifecycle;
pub mod lock;
pub mod mfa;
pub mod roles;
pub mod session;
pub mod ssh;
pub mod tls;
pub mod token;
pub mod types;

// Re-export commonly used types
pub use error::{AuthError, Result};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::authority::{Authority, AuthorityBuilder};
    pub use crate::ca::{CaId, CertAuthority, RotationPhase};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::AuthConfig;
    pub use crate::error::{AuthError, Result};
    pub use crate::identity::Identity;
    pub use crate::issuance::{CertRequest, Certs, CertificateService};
    pub use crate::keystore::KeyStore;
    pub use crate::lock::{LockTarget, LockWatcher};
    pub use crate::mfa::MfaService;
    pub use crate::session::SessionManager;
    pub use crate::types::*;
}
