//! Inventory control plane
//!
//! One bidirectional message stream per connected agent. Upstream the agent
//! sends hello, heartbeats, ping replies, and label acks; downstream the
//! controller sends its own hello, ping requests, and label updates. Each
//! instance carries a persisted control log: qualified entries survive
//! reconnects until a heartbeat acknowledges them, unqualified entries ride
//! the next heartbeat and are dropped.

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::types::Labels;
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Control-log entry kind recorded before a control-log ping
pub const LOG_PING_ATTEMPT: &str = "ping-attempt";
/// Control-log entry kind recorded after a successful control-log ping
pub const LOG_PING_SUCCESS: &str = "ping-success";

/// Retry cap while waiting for a qualified entry to be acknowledged
const MAX_PING_ATTEMPTS: u64 = 16;
/// Backoff unit between acknowledgement checks; multiplied by the attempt
/// index
const PING_BACKOFF: Duration = Duration::from_millis(100);

/// First upstream message on every stream, validated at the RBAC layer
/// before registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamHello {
    /// Agent version
    pub version: String,
    /// Agent server ID
    pub server_id: String,
    /// Services the agent runs
    pub services: Vec<String>,
}

/// Downstream hello, sent after registration; its receipt is the agent's
/// implicit success signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamHello {
    /// Authority version
    pub version: String,
}

/// Messages the agent sends after its hello
#[derive(Debug, Clone)]
pub enum UpstreamMessage {
    /// Periodic heartbeat carrying the agent's current labels
    Heartbeat {
        /// Current labels
        labels: Labels,
    },
    /// Reply to a ping request
    Pong {
        /// ID of the ping being answered
        id: u64,
    },
    /// Acknowledgement of a label update
    LabelAck,
}

/// Messages the controller sends
#[derive(Debug, Clone)]
pub enum DownstreamMessage {
    /// Sent once after registration
    Hello(DownstreamHello),
    /// Request a pong
    Ping {
        /// Correlates the pong
        id: u64,
    },
    /// One-shot label update; the agent acks by reflecting the labels in
    /// its next heartbeat
    LabelUpdate {
        /// New labels
        labels: Labels,
    },
}

/// An entry in an instance's control log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLogEntry {
    /// Unique entry ID
    pub id: String,
    /// Entry kind
    pub kind: String,
    /// When the entry was recorded
    pub time: DateTime<Utc>,
    /// Free-form payload
    pub labels: Labels,
}

impl ControlLogEntry {
    /// A fresh entry of `kind`
    pub fn new(kind: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            time,
            labels: Labels::new(),
        }
    }
}

/// Persisted per-instance state, updated on every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    /// Agent server ID
    pub server_id: String,
    /// Version from the latest hello
    pub version: String,
    /// Services from the latest hello
    pub services: Vec<String>,
    /// Time of the latest heartbeat
    pub last_heartbeat: DateTime<Utc>,
    /// Labels from the latest heartbeat
    pub labels: Labels,
    /// Acknowledged control log
    pub control_log: Vec<ControlLogEntry>,
}

fn instance_key(server_id: &str) -> String {
    format!("inventory/instances/{server_id}")
}

fn pending_key(server_id: &str) -> String {
    format!("inventory/pending/{server_id}")
}

struct HandleState {
    hello: UpstreamHello,
    last_heartbeat: Option<DateTime<Utc>>,
    unqualified_pending: Vec<ControlLogEntry>,
    ping_waiters: HashMap<u64, (Instant, oneshot::Sender<Duration>)>,
    next_ping_id: u64,
}

/// The controller's end of one agent stream
pub struct InventoryHandle {
    tx: mpsc::Sender<DownstreamMessage>,
    state: Mutex<HandleState>,
    heartbeat_notify: Notify,
}

impl InventoryHandle {
    fn new(hello: UpstreamHello, tx: mpsc::Sender<DownstreamMessage>) -> Self {
        Self {
            tx,
            state: Mutex::new(HandleState {
                hello,
                last_heartbeat: None,
                unqualified_pending: Vec::new(),
                ping_waiters: HashMap::new(),
                next_ping_id: 0,
            }),
            heartbeat_notify: Notify::new(),
        }
    }

    /// The hello the agent registered with
    pub fn hello(&self) -> UpstreamHello {
        self.state.lock().unwrap().hello.clone()
    }

    /// Time of the latest heartbeat on this stream
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_heartbeat
    }

    // The handle-local lock serializes state access; no I/O happens while
    // it is held.
    fn visit_state<R>(&self, f: impl FnOnce(&mut HandleState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn fail_waiters(&self) {
        let waiters = self.visit_state(|s| std::mem::take(&mut s.ping_waiters));
        // Dropping the senders errors every outstanding ping immediately
        drop(waiters);
    }
}

/// The inventory controller
pub struct InventoryController {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    version: String,
    handles: RwLock<HashMap<String, Arc<InventoryHandle>>>,
}

impl InventoryController {
    /// A controller reporting `version` in its downstream hello
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, version: impl Into<String>) -> Self {
        Self {
            backend,
            clock,
            version: version.into(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// The handle for a connected agent
    pub fn handle(&self, server_id: &str) -> Result<Arc<InventoryHandle>> {
        self.handles
            .read()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or_else(|| AuthError::not_found(format!("agent {server_id:?} is not connected")))
    }

    /// Persisted state of an instance, connected or not
    pub async fn instance_state(&self, server_id: &str) -> Result<InstanceState> {
        let item = self.backend.get(&instance_key(server_id)).await?;
        unmarshal_item(&item)
    }

    /// Serve one agent stream until the agent disconnects.
    ///
    /// `hello` must already have passed RBAC validation. The downstream
    /// hello is sent after registration; an agent that receives it knows
    /// the stream is live. A reconnect replaces the previous handle for
    /// the same server ID.
    pub async fn handle_stream(
        &self,
        hello: UpstreamHello,
        downstream: mpsc::Sender<DownstreamMessage>,
        mut upstream: mpsc::Receiver<UpstreamMessage>,
    ) -> Result<()> {
        if hello.server_id.is_empty() {
            return Err(AuthError::bad_parameter("agent hello is missing a server ID"));
        }

        let server_id = hello.server_id.clone();
        let handle = Arc::new(InventoryHandle::new(hello, downstream.clone()));
        self.handles
            .write()
            .unwrap()
            .insert(server_id.clone(), handle.clone());
        info!(server_id = %server_id, "agent stream registered");

        let result = async {
            downstream
                .send(DownstreamMessage::Hello(DownstreamHello {
                    version: self.version.clone(),
                }))
                .await
                .map_err(|_| AuthError::connection_problem("agent stream closed"))?;

            while let Some(message) = upstream.recv().await {
                match message {
                    UpstreamMessage::Heartbeat { labels } => {
                        self.process_heartbeat(&handle, labels).await?;
                    }
                    UpstreamMessage::Pong { id } => {
                        let waiter = handle.visit_state(|s| s.ping_waiters.remove(&id));
                        match waiter {
                            Some((sent_at, reply)) => {
                                let latency = sent_at.elapsed().max(Duration::from_micros(1));
                                let _ = reply.send(latency);
                            }
                            None => debug!(server_id = %server_id, id, "pong for unknown ping"),
                        }
                    }
                    UpstreamMessage::LabelAck => {
                        debug!(server_id = %server_id, "label update acknowledged");
                    }
                }
            }
            Ok(())
        }
        .await;

        // Teardown: deregister and fail outstanding ping waiters
        self.handles.write().unwrap().remove(&server_id);
        handle.fail_waiters();
        info!(server_id = %server_id, "agent stream closed");
        result
    }

    async fn process_heartbeat(&self, handle: &Arc<InventoryHandle>, labels: Labels) -> Result<()> {
        let hello = handle.hello();
        let now = self.clock.now();

        let mut state = match self.instance_state(&hello.server_id).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => InstanceState {
                server_id: hello.server_id.clone(),
                version: hello.version.clone(),
                services: hello.services.clone(),
                last_heartbeat: now,
                labels: Labels::new(),
                control_log: Vec::new(),
            },
            Err(e) => return Err(e),
        };

        // Qualified entries merge only if the last acknowledged log does
        // not already carry them
        let pending = self.load_pending(&hello.server_id).await?;
        for entry in pending {
            if !state.control_log.iter().any(|e| e.id == entry.id) {
                state.control_log.push(entry);
            }
        }
        let _ = self.backend.delete(&pending_key(&hello.server_id)).await;

        // Unqualified entries ride exactly one heartbeat
        let unqualified = handle.visit_state(|s| {
            s.last_heartbeat = Some(now);
            std::mem::take(&mut s.unqualified_pending)
        });
        state.control_log.extend(unqualified);

        state.version = hello.version;
        state.services = hello.services;
        state.labels = labels;
        state.last_heartbeat = now;

        let item = marshal_item(instance_key(&state.server_id), &state)?;
        self.backend.put(item).await?;

        handle.heartbeat_notify.notify_waiters();
        Ok(())
    }

    async fn load_pending(&self, server_id: &str) -> Result<Vec<ControlLogEntry>> {
        match self.backend.get(&pending_key(server_id)).await {
            Ok(item) => unmarshal_item(&item),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Append a qualified control-log entry; it persists across reconnects
    /// until a heartbeat acknowledges it
    pub async fn add_qualified_entry(&self, server_id: &str, entry: ControlLogEntry) -> Result<()> {
        // Skip entries the last heartbeat's log already carries
        if let Ok(state) = self.instance_state(server_id).await {
            if state.control_log.iter().any(|e| e.id == entry.id) {
                return Ok(());
            }
        }
        let mut pending = self.load_pending(server_id).await?;
        if !pending.iter().any(|e| e.id == entry.id) {
            pending.push(entry);
        }
        let item = marshal_item(pending_key(server_id), &pending)?;
        self.backend.put(item).await?;
        Ok(())
    }

    /// Attach an unqualified entry to the agent's next heartbeat
    pub fn add_unqualified_entry(&self, server_id: &str, entry: ControlLogEntry) -> Result<()> {
        let handle = self.handle(server_id)?;
        handle.visit_state(|s| s.unqualified_pending.push(entry));
        Ok(())
    }

    async fn direct_ping(&self, server_id: &str) -> Result<Duration> {
        let handle = self.handle(server_id)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = handle.visit_state(|s| {
            s.next_ping_id += 1;
            s.ping_waiters.insert(s.next_ping_id, (Instant::now(), reply_tx));
            s.next_ping_id
        });

        handle
            .tx
            .send(DownstreamMessage::Ping { id })
            .await
            .map_err(|_| AuthError::connection_problem("agent stream closed"))?;

        reply_rx
            .await
            .map_err(|_| AuthError::connection_problem("agent stream closed while awaiting pong"))
    }

    /// Ping a connected agent.
    ///
    /// The control-log variant first records a qualified `ping-attempt`
    /// entry and waits for a heartbeat to acknowledge it (backoff of
    /// 100 ms × attempt, at most 16 attempts), then performs the direct
    /// ping and records an unqualified `ping-success`. It exists to
    /// exercise control-log semantics end to end and does not scale to
    /// frequent use.
    pub async fn ping(&self, server_id: &str, via_control_log: bool) -> Result<Duration> {
        if !via_control_log {
            return self.direct_ping(server_id).await;
        }

        let attempt_entry = ControlLogEntry::new(LOG_PING_ATTEMPT, self.clock.now());
        let entry_id = attempt_entry.id.clone();
        self.add_qualified_entry(server_id, attempt_entry).await?;

        let mut acknowledged = false;
        for attempt in 1..=MAX_PING_ATTEMPTS {
            match self.instance_state(server_id).await {
                Ok(state) if state.control_log.iter().any(|e| e.id == entry_id) => {
                    acknowledged = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if attempt < MAX_PING_ATTEMPTS {
                // Sleep out the backoff, or wake early on the next heartbeat
                let backoff = tokio::time::sleep(PING_BACKOFF * attempt as u32);
                match self.handle(server_id) {
                    Ok(handle) => {
                        tokio::select! {
                            _ = handle.heartbeat_notify.notified() => {}
                            _ = backoff => {}
                        }
                    }
                    Err(_) => backoff.await,
                }
            }
        }
        if !acknowledged {
            warn!(server_id, "ping-attempt entry was never acknowledged");
            return Err(AuthError::limit_exceeded(
                "ping attempt was not acknowledged within the retry budget",
            ));
        }

        let latency = self.direct_ping(server_id).await?;

        let success_entry = ControlLogEntry::new(LOG_PING_SUCCESS, self.clock.now());
        self.add_unqualified_entry(server_id, success_entry)?;

        Ok(latency)
    }

    /// Send a one-shot label update to a connected agent
    pub async fn update_labels(&self, server_id: &str, labels: Labels) -> Result<()> {
        let handle = self.handle(server_id)?;
        handle
            .tx
            .send(DownstreamMessage::LabelUpdate { labels })
            .await
            .map_err(|_| AuthError::connection_problem("agent stream closed"))
    }

    /// Versions of every connected agent, for the version reporter
    pub fn connected_versions(&self) -> Vec<(String, String)> {
        self.handles
            .read()
            .unwrap()
            .values()
            .map(|h| {
                let hello = h.hello();
                (hello.server_id, hello.version)
            })
            .collect()
    }
}
