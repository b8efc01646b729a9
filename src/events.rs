//! Audit events
//!
//! Every security-relevant mutation emits an [`AuditEvent`] through the
//! [`AuditEmitter`] seam. The real emitter ships events to the external
//! audit log; the core only guarantees that the right events fire with the
//! right payloads.

use crate::identity::Identity;
use crate::types::CertAuthType;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

/// A security-relevant event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A certificate was issued
    CertificateIssued {
        /// `user` or `host`
        cert_kind: String,
        /// Final identity snapshot bound into the certificate
        identity: Identity,
    },
    /// An MFA device was enrolled
    MfaDeviceAdded {
        user: String,
        device_name: String,
        device_kind: String,
    },
    /// An MFA device was removed
    MfaDeviceDeleted {
        user: String,
        device_name: String,
        device_kind: String,
    },
    /// A user was locked out after consecutive authentication failures
    UserLocked {
        user: String,
        until: DateTime<Utc>,
        reason: String,
    },
    /// A web session was created
    SessionCreated { user: String, session_id: String },
    /// A web session was derived from an existing one
    SessionExtended { user: String, session_id: String },
    /// A CA rotation advanced to a new phase
    RotationPhaseChanged {
        ca_type: CertAuthType,
        cluster: String,
        phase: String,
    },
    /// A headless authentication changed state
    HeadlessAuthenticationUpdated {
        name: String,
        user: String,
        state: String,
    },
}

/// Destination for audit events
#[async_trait]
pub trait AuditEmitter: Send + Sync {
    /// Emit one event. Failures are the emitter's problem; callers treat
    /// emission as best-effort unless stated otherwise.
    async fn emit(&self, event: AuditEvent) -> Result<()>;
}

/// Emitter that writes events to the log; the default wiring
#[derive(Debug, Default)]
pub struct LogEmitter;

#[async_trait]
impl AuditEmitter for LogEmitter {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        info!(target: "audit", event = ?event, "audit event");
        Ok(())
    }
}

/// Emitter that records events in memory for assertions
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingEmitter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

#[async_trait]
impl AuditEmitter for RecordingEmitter {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
