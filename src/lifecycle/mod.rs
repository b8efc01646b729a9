//! CA lifecycle
//!
//! Creates self-signed CAs, stages freshly provisioned local keys into the
//! additional-trusted set, drives the four-phase rotation state machine,
//! and garbage-collects keys no CA references. Every mutation is a
//! compare-and-swap against the latest CA revision, retried on contention.

use crate::ca::{CaCache, CaId, CaKeySet, CertAuthority, RotationPhase, RotationState};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::events::{AuditEmitter, AuditEvent};
use crate::keystore::KeyStore;
use crate::types::CertAuthType;
use crate::{AuthError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Base period of the bookkeeping tick; a jitter of up to
/// [`PERIODIC_JITTER`] is added so multiple auth instances do not stampede
pub const PERIODIC_BASE: Duration = Duration::from_secs(9 * 60);
/// Maximum jitter added to [`PERIODIC_BASE`]
pub const PERIODIC_JITTER: Duration = Duration::from_secs(60);

/// A request to advance a CA rotation by one phase
#[derive(Debug, Clone)]
pub struct RotationRequest {
    /// CA to rotate
    pub ca_type: CertAuthType,
    /// Phase to advance to; must be the successor of the current phase
    pub target_phase: RotationPhase,
    /// Grace period before periodic bookkeeping advances further; `None`
    /// keeps the configured default
    pub grace: Option<Duration>,
}

/// The CA lifecycle driver
pub struct CaLifecycle {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    cas: Arc<CaCache>,
    keystore: Arc<KeyStore>,
    emitter: Arc<dyn AuditEmitter>,
}

impl CaLifecycle {
    /// Assemble the driver
    pub fn new(
        config: AuthConfig,
        clock: Arc<dyn Clock>,
        cas: Arc<CaCache>,
        keystore: Arc<KeyStore>,
        emitter: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            config,
            clock,
            cas,
            keystore,
            emitter,
        }
    }

    fn ca_id(&self, kind: CertAuthType) -> CaId {
        CaId::new(kind, &self.config.cluster_name)
    }

    /// Provision a new CA with a key set of the right shape for its type
    pub async fn create_self_signed_ca(&self, kind: CertAuthType) -> Result<CertAuthority> {
        let keys = self.keystore.new_key_set(kind).await?;
        let ca = CertAuthority::new(self.ca_id(kind), keys);
        self.cas.create(&ca).await?;
        info!(ca = %kind, cluster = %self.config.cluster_name, "created self-signed CA");
        self.cas.store().get(&ca.id).await
    }

    /// Provision every CA type that does not exist yet
    pub async fn bootstrap(&self) -> Result<()> {
        for kind in CertAuthType::ALL {
            match self.create_self_signed_ca(kind).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stage locally usable keys into the CA's additional-trusted set.
    ///
    /// Used when an auth instance with a new HSM or KMS backing joins a
    /// cluster whose CAs it cannot sign for yet. Idempotent: when a usable
    /// local key already exists in either set, no write happens. Returns
    /// whether a write happened.
    pub async fn ensure_local_additional_keys(&self, kind: CertAuthType) -> Result<bool> {
        loop {
            let ca = self.cas.store().get(&self.ca_id(kind)).await?;

            if self.keystore.has_usable_active_keys(&ca)
                || self.keystore.has_usable_additional_keys(&ca)
            {
                return Ok(false);
            }

            let local_keys = self.keystore.new_key_set(kind).await?;
            let mut updated = ca;
            updated.additional_trusted_keys.merge(local_keys);

            match self.cas.compare_and_swap(&updated).await {
                Ok(_) => {
                    info!(ca = %kind, "staged local keys into the additional-trusted set");
                    return Ok(true);
                }
                // Raced another writer: retry against the latest version
                Err(e) if e.is_compare_failed() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance a CA rotation by one phase.
    ///
    /// The cycle is standby → init → update_clients → update_servers →
    /// standby. `init` stages new keys as additional-trusted; signing stays
    /// on the old keys until `update_servers` promotes the staged set; the
    /// final transition back to standby demotes the old keys, making them
    /// eligible for garbage collection.
    pub async fn rotate(&self, req: RotationRequest) -> Result<CertAuthority> {
        loop {
            let ca = self.cas.store().get(&self.ca_id(req.ca_type)).await?;
            let current = ca.rotation.phase;

            if req.target_phase != current.next() {
                return Err(AuthError::bad_parameter(format!(
                    "rotation phase {} cannot follow {}",
                    req.target_phase.as_str(),
                    current.as_str()
                )));
            }

            let grace = req.grace.unwrap_or(self.config.rotation_grace);
            let now = self.clock.now();
            let mut updated = ca;

            match req.target_phase {
                RotationPhase::Init => {
                    let staged = self.keystore.new_key_set(req.ca_type).await?;
                    updated.additional_trusted_keys.merge(staged.clone());
                    updated.rotation = RotationState {
                        phase: RotationPhase::Init,
                        started: Some(now),
                        grace,
                        staged: Some(staged),
                    };
                }
                RotationPhase::UpdateClients => {
                    // Clients re-fetch trust; nothing moves yet
                    updated.rotation.phase = RotationPhase::UpdateClients;
                    updated.rotation.started = Some(now);
                    updated.rotation.grace = grace;
                }
                RotationPhase::UpdateServers => {
                    let staged = updated.rotation.staged.clone().ok_or_else(|| {
                        AuthError::bad_parameter("rotation has no staged keys to promote")
                    })?;
                    let old_active =
                        std::mem::replace(&mut updated.active_keys, staged.clone());
                    updated.additional_trusted_keys.remove_all(&staged);
                    updated.additional_trusted_keys.merge(old_active);
                    updated.rotation.phase = RotationPhase::UpdateServers;
                    updated.rotation.started = Some(now);
                    updated.rotation.grace = grace;
                }
                RotationPhase::Standby => {
                    // Demote the previous keys; they stop being trusted and
                    // become eligible for GC
                    updated.additional_trusted_keys = CaKeySet::default();
                    updated.rotation = RotationState::default();
                }
            }

            match self.cas.compare_and_swap(&updated).await {
                Ok(_) => {
                    info!(
                        ca = %req.ca_type,
                        phase = req.target_phase.as_str(),
                        "rotation advanced"
                    );
                    let _ = self
                        .emitter
                        .emit(AuditEvent::RotationPhaseChanged {
                            ca_type: req.ca_type,
                            cluster: self.config.cluster_name.clone(),
                            phase: req.target_phase.as_str().to_string(),
                        })
                        .await;
                    return self.cas.store().get(&self.ca_id(req.ca_type)).await;
                }
                Err(e) if e.is_compare_failed() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance any rotation whose grace period has elapsed
    pub async fn advance_due_rotations(&self) -> Result<()> {
        let now = self.clock.now();
        for ca in self.cas.store().all(&self.config.cluster_name).await? {
            let rotation = &ca.rotation;
            if rotation.phase == RotationPhase::Standby {
                continue;
            }
            let due = match rotation.started {
                Some(started) => {
                    let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
                    elapsed >= rotation.grace
                }
                None => true,
            };
            if !due {
                continue;
            }
            let next = rotation.phase.next();
            if let Err(e) = self
                .rotate(RotationRequest {
                    ca_type: ca.id.kind,
                    target_phase: next,
                    grace: Some(rotation.grace),
                })
                .await
            {
                warn!(ca = %ca.id.kind, error = %e, "periodic rotation advance failed");
            }
        }
        Ok(())
    }

    /// Delete every backing key not referenced by any CA's key sets.
    ///
    /// Best-effort; failures are logged by the keystore and never fatal.
    pub async fn delete_unused_keys(&self) -> Result<()> {
        let mut in_use = Vec::new();
        for ca in self.cas.store().all(&self.config.cluster_name).await? {
            in_use.extend(ca.all_key_refs());
        }
        self.keystore.delete_unused_keys(&in_use).await;
        Ok(())
    }

    /// One bookkeeping pass: refresh the CA cache, top up the software key
    /// pool, advance due rotations, collect unused keys
    pub async fn tick(&self) {
        self.cas.refresh();
        if let Err(e) = self.keystore.pool().refill() {
            warn!(error = %e, "software key pool refill failed");
        }
        if let Err(e) = self.advance_due_rotations().await {
            warn!(error = %e, "rotation bookkeeping failed");
        }
        if let Err(e) = self.delete_unused_keys().await {
            warn!(error = %e, "unused key collection failed");
        }
    }

    /// Run periodic bookkeeping until `shutdown` fires. Each sleep is
    /// jittered so auth instances spread their work.
    pub async fn run_periodic(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..PERIODIC_JITTER);
            tokio::select! {
                _ = tokio::time::sleep(PERIODIC_BASE + jitter) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
