//! Backend key/value storage
//!
//! The authority persists everything through this seam: certificate
//! authorities, users, sessions, tokens, locks, inventory state. The backend
//! provides linearizable per-key reads and writes; every stored item carries
//! a monotonic revision used for optimistic concurrency.

use crate::clock::Clock;
use crate::{AuthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A stored item
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Hierarchical key, e.g. `authorities/user/example.com`
    pub key: String,
    /// Opaque serialized value
    pub value: Vec<u8>,
    /// Revision assigned by the backend on write; zero before the first write
    pub revision: u64,
    /// Optional expiry; expired items are invisible to reads
    pub expires: Option<DateTime<Utc>>,
}

impl Item {
    /// Create an item with no expiry
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            revision: 0,
            expires: None,
        }
    }

    /// Set an expiry
    pub fn with_expiry(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Key/value store with per-key linearizability and revisioned writes
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch an item; `NotFound` if absent or expired
    async fn get(&self, key: &str) -> Result<Item>;

    /// Create an item; `AlreadyExists` if the key is present
    async fn create(&self, item: Item) -> Result<u64>;

    /// Write an item unconditionally, returning the new revision
    async fn put(&self, item: Item) -> Result<u64>;

    /// Replace an item only if its current revision matches `expected`;
    /// `CompareFailed` otherwise
    async fn compare_and_swap(&self, expected_revision: u64, item: Item) -> Result<u64>;

    /// Delete an item; `NotFound` if absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// All unexpired items whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<Item>>;
}

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    revision: u64,
    expires: Option<DateTime<Utc>>,
}

/// In-memory backend with linearizable semantics; the test substrate and
/// the reference implementation of the revision contract
pub struct MemoryBackend {
    items: RwLock<BTreeMap<String, Stored>>,
    revision: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            clock,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_expired(&self, stored: &Stored) -> bool {
        stored
            .expires
            .map(|exp| exp <= self.clock.now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Item> {
        let items = self.items.read().unwrap();
        match items.get(key) {
            Some(stored) if !self.is_expired(stored) => Ok(Item {
                key: key.to_string(),
                value: stored.value.clone(),
                revision: stored.revision,
                expires: stored.expires,
            }),
            _ => Err(AuthError::not_found(format!("key {key:?} is not found"))),
        }
    }

    async fn create(&self, item: Item) -> Result<u64> {
        let mut items = self.items.write().unwrap();
        if let Some(existing) = items.get(&item.key) {
            if !self.is_expired(existing) {
                return Err(AuthError::already_exists(format!(
                    "key {:?} already exists",
                    item.key
                )));
            }
        }
        let revision = self.next_revision();
        items.insert(
            item.key,
            Stored {
                value: item.value,
                revision,
                expires: item.expires,
            },
        );
        Ok(revision)
    }

    async fn put(&self, item: Item) -> Result<u64> {
        let mut items = self.items.write().unwrap();
        let revision = self.next_revision();
        items.insert(
            item.key,
            Stored {
                value: item.value,
                revision,
                expires: item.expires,
            },
        );
        Ok(revision)
    }

    async fn compare_and_swap(&self, expected_revision: u64, item: Item) -> Result<u64> {
        let mut items = self.items.write().unwrap();
        let current = items
            .get(&item.key)
            .filter(|s| !self.is_expired(s))
            .ok_or_else(|| AuthError::not_found(format!("key {:?} is not found", item.key)))?;

        if current.revision != expected_revision {
            debug!(
                key = %item.key,
                expected = expected_revision,
                actual = current.revision,
                "compare-and-swap lost"
            );
            return Err(AuthError::compare_failed(format!(
                "key {:?} was concurrently modified",
                item.key
            )));
        }

        let revision = self.next_revision();
        items.insert(
            item.key,
            Stored {
                value: item.value,
                revision,
                expires: item.expires,
            },
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut items = self.items.write().unwrap();
        match items.remove(key) {
            Some(_) => Ok(()),
            None => Err(AuthError::not_found(format!("key {key:?} is not found"))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Item>> {
        let items = self.items.read().unwrap();
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, s)| !self.is_expired(s))
            .map(|(k, s)| Item {
                key: k.clone(),
                value: s.value.clone(),
                revision: s.revision,
                expires: s.expires,
            })
            .collect())
    }
}

/// Serialize a value into an item at `key`
pub fn marshal_item<T: serde::Serialize>(key: impl Into<String>, value: &T) -> Result<Item> {
    Ok(Item::new(key, serde_json::to_vec(value)?))
}

/// Deserialize an item's value
pub fn unmarshal_item<T: serde::de::DeserializeOwned>(item: &Item) -> Result<T> {
    Ok(serde_json::from_slice(&item.value)?)
}
