//! The assembled authority
//!
//! Wires the subsystems together over one backend, clock, and audit
//! emitter, and owns the shared shutdown signal every background task
//! observes. [`Authority::close`] cancels that signal; each periodic task
//! stops within one tick.

use crate::backend::Backend;
use crate::ca::{CaCache, CaStore};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::events::AuditEmitter;
use crate::headless::HeadlessStore;
use crate::inventory::InventoryController;
use crate::issuance::{Attestor, CertificateService, NoAttestation};
use crate::keystore::{KeyStore, RemoteKeyBacking};
use crate::lifecycle::CaLifecycle;
use crate::lock::LockWatcher;
use crate::mfa::MfaService;
use crate::roles::{RoleStore, UserStore};
use crate::session::SessionManager;
use crate::token::{ProvisionToken, TokenStore};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Builder-style assembly of an [`Authority`]
pub struct AuthorityBuilder {
    config: AuthConfig,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn AuditEmitter>,
    attestor: Arc<dyn Attestor>,
    remote_backing: Option<Arc<dyn RemoteKeyBacking>>,
    static_tokens: Vec<ProvisionToken>,
}

impl AuthorityBuilder {
    /// Start assembling over a backend and clock
    pub fn new(config: AuthConfig, backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            backend,
            clock,
            emitter: Arc::new(crate::events::LogEmitter),
            attestor: Arc::new(NoAttestation),
            remote_backing: None,
            static_tokens: Vec::new(),
        }
    }

    /// Install an audit emitter
    pub fn emitter(mut self, emitter: Arc<dyn AuditEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Install an attestation capability
    pub fn attestor(mut self, attestor: Arc<dyn Attestor>) -> Self {
        self.attestor = attestor;
        self
    }

    /// Install an HSM/KMS capability
    pub fn remote_key_backing(mut self, backing: Arc<dyn RemoteKeyBacking>) -> Self {
        self.remote_backing = Some(backing);
        self
    }

    /// Install configured static provision tokens
    pub fn static_tokens(mut self, tokens: Vec<ProvisionToken>) -> Self {
        self.static_tokens = tokens;
        self
    }

    /// Assemble the authority
    pub fn build(self) -> Authority {
        let config = self.config;
        let mut keystore = KeyStore::new(
            config.cluster_name.clone(),
            config.host_id,
            config.keystore.clone(),
            self.clock.clone(),
        );
        if let Some(backing) = self.remote_backing {
            keystore = keystore.with_remote_backing(backing);
        }
        let keystore = Arc::new(keystore);

        let cas = Arc::new(CaCache::new(CaStore::new(self.backend.clone())));
        let locks = Arc::new(LockWatcher::new(
            self.backend.clone(),
            self.clock.clone(),
            config.cluster_name.clone(),
        ));
        let users = UserStore::new(self.backend.clone());
        let roles = RoleStore::new(self.backend.clone());

        let issuance = Arc::new(CertificateService::new(
            config.clone(),
            self.clock.clone(),
            cas.clone(),
            keystore.clone(),
            locks.clone(),
            self.emitter.clone(),
            self.attestor,
            self.backend.clone(),
        ));

        let sessions = SessionManager::new(
            self.backend.clone(),
            self.clock.clone(),
            self.emitter.clone(),
            issuance.clone(),
            users.clone(),
            roles.clone(),
            config.session.clone(),
        );

        let mfa = MfaService::new(
            self.backend.clone(),
            users.clone(),
            self.clock.clone(),
            self.emitter.clone(),
            config.second_factor,
            config.lockout.clone(),
        );

        let lifecycle = CaLifecycle::new(
            config.clone(),
            self.clock.clone(),
            cas.clone(),
            keystore.clone(),
            self.emitter.clone(),
        );

        let inventory = InventoryController::new(
            self.backend.clone(),
            self.clock.clone(),
            env!("CARGO_PKG_VERSION"),
        );

        let headless = HeadlessStore::new(
            self.backend.clone(),
            self.clock.clone(),
            self.emitter.clone(),
        );

        let tokens = TokenStore::new(self.backend.clone(), self.clock.clone(), self.static_tokens);

        let alerts = crate::alerts::AlertStore::new(self.backend.clone(), self.clock.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Authority {
            config,
            issuance,
            sessions,
            mfa,
            lifecycle,
            inventory,
            headless,
            tokens,
            alerts,
            locks,
            cas,
            keystore,
            users,
            roles,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

/// The cluster authority core, fully wired
pub struct Authority {
    /// Static configuration
    pub config: AuthConfig,
    /// Certificate issuance pipeline
    pub issuance: Arc<CertificateService>,
    /// Web session manager
    pub sessions: SessionManager,
    /// MFA subsystem
    pub mfa: MfaService,
    /// CA lifecycle driver
    pub lifecycle: CaLifecycle,
    /// Inventory control plane
    pub inventory: InventoryController,
    /// Headless authentication store
    pub headless: HeadlessStore,
    /// Provision token store
    pub tokens: TokenStore,
    /// Cluster alert store
    pub alerts: crate::alerts::AlertStore,
    /// Lock watcher
    pub locks: Arc<LockWatcher>,
    /// CA cache over the authoritative store
    pub cas: Arc<CaCache>,
    /// Keystore manager
    pub keystore: Arc<KeyStore>,
    /// User storage
    pub users: UserStore,
    /// Role storage
    pub roles: RoleStore,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Authority {
    /// Provision missing CAs and prime the lock view
    pub async fn bootstrap(&self) -> Result<()> {
        self.lifecycle.bootstrap().await?;
        self.locks.refresh().await?;
        self.keystore.pool().refill()?;
        info!(cluster = %self.config.cluster_name, "authority bootstrapped");
        Ok(())
    }

    /// A receiver on the shared shutdown signal, for externally spawned
    /// tasks
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Spawn the periodic background tasks. They all stop within one tick
    /// of [`close`](Self::close).
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let authority = self.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            authority.lifecycle.run_periodic(shutdown).await;
        });

        let authority = self.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            authority
                .locks
                .run(Duration::from_secs(3), shutdown)
                .await;
        });
    }

    /// Cancel the shared shutdown signal
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        info!(cluster = %self.config.cluster_name, "authority closing");
    }
}
