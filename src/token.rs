//! Provision tokens
//!
//! Tokens that let nodes and services join the cluster. Names are secrets:
//! lookups compare with constant-time equality. Static tokens come from
//! configuration, never expire, and cannot be deleted through the dynamic
//! path.

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::types::Labels;
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use ring::constant_time::verify_slices_are_equal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A provision token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionToken {
    /// Token name; compared in constant time
    pub name: String,
    /// System roles the token grants at join
    pub roles: Vec<String>,
    /// Expiry; `None` means the token never expires
    pub expires: Option<DateTime<Utc>>,
    /// Labels propagated onto joined resources
    pub labels: Labels,
}

impl ProvisionToken {
    /// Whether `candidate` names this token; constant-time
    pub fn name_matches(&self, candidate: &str) -> bool {
        verify_slices_are_equal(self.name.as_bytes(), candidate.as_bytes()).is_ok()
    }
}

fn token_key(name: &str) -> String {
    format!("tokens/{name}")
}

/// Provision token storage
pub struct TokenStore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    static_tokens: Vec<ProvisionToken>,
}

impl TokenStore {
    /// A store over the backend with the configured static tokens
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        static_tokens: Vec<ProvisionToken>,
    ) -> Self {
        Self {
            backend,
            clock,
            static_tokens,
        }
    }

    /// Create a dynamic token
    pub async fn create(&self, token: ProvisionToken) -> Result<()> {
        if token.name.is_empty() {
            return Err(AuthError::bad_parameter("token name cannot be empty"));
        }
        if self.static_tokens.iter().any(|t| t.name_matches(&token.name)) {
            return Err(AuthError::already_exists("token already exists"));
        }
        let mut item = marshal_item(token_key(&token.name), &token)?;
        if let Some(expires) = token.expires {
            item = item.with_expiry(expires);
        }
        self.backend.create(item).await?;
        Ok(())
    }

    /// Look a token up by name.
    ///
    /// Every stored name is compared in constant time so lookup latency
    /// does not reveal near-misses.
    pub async fn get(&self, name: &str) -> Result<ProvisionToken> {
        let mut found: Option<ProvisionToken> = None;

        for token in &self.static_tokens {
            if token.name_matches(name) && found.is_none() {
                found = Some(token.clone());
            }
        }

        let now = self.clock.now();
        for item in self.backend.list("tokens/").await? {
            let token: ProvisionToken = unmarshal_item(&item)?;
            let expired = token.expires.map(|e| e <= now).unwrap_or(false);
            if token.name_matches(name) && !expired && found.is_none() {
                found = Some(token);
            }
        }

        found.ok_or_else(|| AuthError::not_found("token is not found"))
    }

    /// Delete a dynamic token.
    ///
    /// Static tokens live in configuration and cannot be removed here.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if self.static_tokens.iter().any(|t| t.name_matches(name)) {
            return Err(AuthError::bad_parameter(
                "static tokens cannot be deleted dynamically",
            ));
        }
        self.backend.delete(&token_key(name)).await.map_err(|e| {
            if e.is_not_found() {
                AuthError::not_found("token is not found")
            } else {
                e
            }
        })
    }

    /// Every dynamic token currently stored
    pub async fn list(&self) -> Result<Vec<ProvisionToken>> {
        let mut tokens = Vec::new();
        for item in self.backend.list("tokens/").await? {
            tokens.push(unmarshal_item(&item)?);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;

    fn store_with_static() -> (Arc<ManualClock>, TokenStore) {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let static_token = ProvisionToken {
            name: "static-join-token".to_string(),
            roles: vec!["node".to_string()],
            expires: None,
            labels: Labels::new(),
        };
        (
            clock.clone(),
            TokenStore::new(backend, clock, vec![static_token]),
        )
    }

    #[tokio::test]
    async fn test_dynamic_token_lifecycle() {
        let (clock, store) = store_with_static();
        let token = ProvisionToken {
            name: "dynamic-1".to_string(),
            roles: vec!["proxy".to_string()],
            expires: Some(clock.now() + chrono::Duration::minutes(30)),
            labels: Labels::new(),
        };
        store.create(token).await.unwrap();

        let loaded = store.get("dynamic-1").await.unwrap();
        assert_eq!(loaded.roles, vec!["proxy".to_string()]);

        // Expiry hides the token
        clock.advance(chrono::Duration::minutes(31));
        assert!(store.get("dynamic-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_static_token_found_but_not_deletable() {
        let (_, store) = store_with_static();
        let token = store.get("static-join-token").await.unwrap();
        assert!(token.expires.is_none());

        let err = store.delete("static-join-token").await.unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_near_miss_names_do_not_match() {
        let (_, store) = store_with_static();
        assert!(store.get("static-join-toke").await.unwrap_err().is_not_found());
        assert!(store.get("static-join-tokenn").await.unwrap_err().is_not_found());
    }
}
