use crate::error::Result;
use crate::store::{SessionStore, UsageDelta};
use crate::types::{period_start, MessageDirection, UsageRecord};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Monotonic per-org monthly counters, upserted through the store.
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn SessionStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Count one persisted message in the current calendar month.
    pub async fn record_message(&self, org_id: Uuid, direction: MessageDirection) -> Result<()> {
        let delta = match direction {
            MessageDirection::Inbound => UsageDelta::received(),
            MessageDirection::Outbound => UsageDelta::sent(),
        };
        self.store
            .increment_usage(org_id, period_start(Utc::now()), delta)
            .await
    }

    /// Best-effort variants for advisory counters. Failures are logged, not
    /// propagated, so metering never blocks the hot path.
    pub async fn record_session_active(&self, org_id: Uuid) {
        if let Err(e) = self
            .store
            .increment_usage(org_id, period_start(Utc::now()), UsageDelta::session_active())
            .await
        {
            warn!(%org_id, error = %e, "failed to record active session");
        }
    }

    pub async fn record_api_call(&self, org_id: Uuid) {
        if let Err(e) = self
            .store
            .increment_usage(org_id, period_start(Utc::now()), UsageDelta::api_call())
            .await
        {
            warn!(%org_id, error = %e, "failed to record api call");
        }
    }

    pub async fn current_month(&self, org_id: Uuid) -> Result<UsageRecord> {
        self.store
            .get_usage(org_id, period_start(Utc::now()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_one_increment_per_message() {
        let store = Arc::new(MemoryStore::new());
        let meter = UsageMeter::new(store.clone());
        let org_id = Uuid::new_v4();

        meter
            .record_message(org_id, MessageDirection::Inbound)
            .await
            .unwrap();
        meter
            .record_message(org_id, MessageDirection::Outbound)
            .await
            .unwrap();

        let usage = meter.current_month(org_id).await.unwrap();
        assert_eq!(usage.messages_received, 1);
        assert_eq!(usage.messages_sent, 1);
    }
}
