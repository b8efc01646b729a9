//! Cluster alerts
//!
//! Operator-facing banners stored in the backend. Two IDs are well known:
//! an upgrade suggestion and a security-patch notice; when a recipient is
//! authorized for both, the security patch supersedes the suggestion.

use crate::backend::{marshal_item, unmarshal_item, Backend};
use crate::clock::Clock;
use crate::types::{AlertSeverity, Labels, ALERT_SECURITY_PATCH, ALERT_UPGRADE_SUGGESTION};
use crate::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A cluster alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAlert {
    /// Alert ID, unique in the cluster
    pub id: String,
    /// Severity, used for display ordering
    pub severity: AlertSeverity,
    /// Message shown to operators
    pub message: String,
    /// Labels gating which recipients see the alert
    pub labels: Labels,
    /// Expiry; `None` keeps the alert until deleted
    pub expires: Option<DateTime<Utc>>,
}

fn alert_key(id: &str) -> String {
    format!("alerts/{id}")
}

/// Cluster alert storage
pub struct AlertStore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
}

impl AlertStore {
    /// A store over the backend
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Create or replace an alert
    pub async fn upsert(&self, alert: ClusterAlert) -> Result<()> {
        if alert.id.is_empty() {
            return Err(AuthError::bad_parameter("alert ID cannot be empty"));
        }
        let mut item = marshal_item(alert_key(&alert.id), &alert)?;
        if let Some(expires) = alert.expires {
            item = item.with_expiry(expires);
        }
        self.backend.put(item).await?;
        Ok(())
    }

    /// Fetch one alert
    pub async fn get(&self, id: &str) -> Result<ClusterAlert> {
        let item = self.backend.get(&alert_key(id)).await?;
        unmarshal_item(&item)
    }

    /// Delete one alert
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(&alert_key(id)).await
    }

    /// Every unexpired alert
    pub async fn list(&self) -> Result<Vec<ClusterAlert>> {
        let now = self.clock.now();
        let mut alerts = Vec::new();
        for item in self.backend.list("alerts/").await? {
            let alert: ClusterAlert = unmarshal_item(&item)?;
            if alert.expires.map(|e| e <= now).unwrap_or(false) {
                continue;
            }
            alerts.push(alert);
        }
        Ok(alerts)
    }

    /// Alerts visible to a recipient authorized for `authorized_ids`.
    ///
    /// When both well-known alerts are authorized, the security-patch
    /// notice supersedes the upgrade suggestion.
    pub async fn visible(&self, authorized_ids: &[String]) -> Result<Vec<ClusterAlert>> {
        let all = self.list().await?;
        let mut visible: Vec<ClusterAlert> = all
            .into_iter()
            .filter(|a| authorized_ids.iter().any(|id| id == &a.id))
            .collect();

        let has_patch = visible.iter().any(|a| a.id == ALERT_SECURITY_PATCH);
        if has_patch {
            visible.retain(|a| a.id != ALERT_UPGRADE_SUGGESTION);
        }

        visible.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.id.cmp(&b.id)));
        Ok(visible)
    }
}

/// The cluster's agreed maintenance window, consulted before pushing agent
/// upgrades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// When the window opens
    pub start: DateTime<Utc>,
    /// How long it stays open, in seconds
    pub duration_secs: u64,
}

impl MaintenanceWindow {
    /// Whether `now` falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.start && now < self.start + chrono::Duration::seconds(self.duration_secs as i64)
    }
}

const MAINTENANCE_WINDOW_KEY: &str = "cluster/maintenance_window";

impl AlertStore {
    /// Record the cluster maintenance window
    pub async fn set_maintenance_window(&self, window: MaintenanceWindow) -> Result<()> {
        let item = marshal_item(MAINTENANCE_WINDOW_KEY, &window)?;
        self.backend.put(item).await?;
        Ok(())
    }

    /// The recorded maintenance window, if any
    pub async fn maintenance_window(&self) -> Result<Option<MaintenanceWindow>> {
        match self.backend.get(MAINTENANCE_WINDOW_KEY).await {
            Ok(item) => Ok(Some(unmarshal_item(&item)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;

    fn store() -> AlertStore {
        let clock = Arc::new(ManualClock::default());
        AlertStore::new(Arc::new(MemoryBackend::new(clock.clone())), clock)
    }

    fn alert(id: &str, severity: AlertSeverity) -> ClusterAlert {
        ClusterAlert {
            id: id.to_string(),
            severity,
            message: format!("{id} message"),
            labels: Labels::new(),
            expires: None,
        }
    }

    #[tokio::test]
    async fn test_security_patch_supersedes_upgrade_suggestion() {
        let store = store();
        store
            .upsert(alert(ALERT_UPGRADE_SUGGESTION, AlertSeverity::Low))
            .await
            .unwrap();
        store
            .upsert(alert(ALERT_SECURITY_PATCH, AlertSeverity::High))
            .await
            .unwrap();

        // Authorized for both: only the patch shows
        let visible = store
            .visible(&[
                ALERT_UPGRADE_SUGGESTION.to_string(),
                ALERT_SECURITY_PATCH.to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, ALERT_SECURITY_PATCH);

        // Authorized only for the suggestion: it still shows
        let visible = store
            .visible(&[ALERT_UPGRADE_SUGGESTION.to_string()])
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, ALERT_UPGRADE_SUGGESTION);
    }

    #[tokio::test]
    async fn test_maintenance_window_round_trip() {
        let store = store();
        assert!(store.maintenance_window().await.unwrap().is_none());

        let start = chrono::Utc::now();
        store
            .set_maintenance_window(MaintenanceWindow {
                start,
                duration_secs: 3600,
            })
            .await
            .unwrap();

        let window = store.maintenance_window().await.unwrap().unwrap();
        assert!(window.contains(start + chrono::Duration::minutes(30)));
        assert!(!window.contains(start + chrono::Duration::minutes(61)));
    }

    #[tokio::test]
    async fn test_severity_orders_visible_alerts() {
        let store = store();
        store.upsert(alert("a-low", AlertSeverity::Low)).await.unwrap();
        store.upsert(alert("b-high", AlertSeverity::High)).await.unwrap();

        let visible = store
            .visible(&["a-low".to_string(), "b-high".to_string()])
            .await
            .unwrap();
        assert_eq!(visible[0].id, "b-high");
        assert_eq!(visible[1].id, "a-low");
    }
}
