use crate::dispatcher::WebhookDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use wabridge_core::store::SessionStore;

/// Periodic CRM backfill: re-delivers inbound messages that never reached
/// the tenant webhook. This is the authoritative recovery path for retries
/// lost to a restart, so the first pass runs right at startup.
pub struct SyncJob {
    store: Arc<dyn SessionStore>,
    dispatcher: WebhookDispatcher,
    period: Duration,
    batch_limit: i64,
}

impl SyncJob {
    pub fn new(
        store: Arc<dyn SessionStore>,
        dispatcher: WebhookDispatcher,
        period: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            period,
            batch_limit: 100,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_secs = self.period.as_secs(), "webhook sync job started");
            let mut ticker = interval(self.period);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One backfill pass over every org with a webhook configured.
    pub async fn run_once(&self) {
        let orgs = match self.store.list_organizations().await {
            Ok(orgs) => orgs,
            Err(e) => {
                warn!(error = %e, "sync pass skipped: org listing failed");
                return;
            }
        };

        for org in orgs {
            if org.webhook_url.is_none() {
                continue;
            }
            let pending = match self.store.list_pending_crm_sync(org.id, self.batch_limit).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(org_id = %org.id, error = %e, "sync pass skipped for org");
                    continue;
                }
            };
            if pending.is_empty() {
                continue;
            }
            debug!(org_id = %org.id, count = pending.len(), "backfilling webhook deliveries");
            for message in pending {
                self.dispatcher.deliver_and_wait(message).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::WebhookConfig;
    use chrono::Utc;
    use uuid::Uuid;
    use wabridge_core::store::MemoryStore;
    use wabridge_core::types::{
        MessageDirection, MessageInput, Organization, SubscriptionTier, WebhookStatus,
    };
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_run_once_delivers_pending_backlog() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let org = Organization {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            name: "Acme".to_string(),
            tier: SubscriptionTier::Free,
            max_accounts: 1,
            max_messages_per_month: 100,
            api_token: "tok".to_string(),
            webhook_url: Some(server.uri()),
            crm_api_key: None,
            crm_location_id: None,
            created_at: Utc::now(),
        };
        store.create_organization(&org).await.unwrap();
        for i in 0..2 {
            store
                .save_message(MessageInput::text(
                    "s1",
                    org.id,
                    &format!("wamid.{i}"),
                    MessageDirection::Inbound,
                    "+1",
                    "+2",
                    "backlog",
                ))
                .await
                .unwrap();
        }

        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            WebhookConfig {
                retry_base_delay: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let job = SyncJob::new(store.clone(), dispatcher, Duration::from_secs(3600));
        job.run_once().await;

        assert!(store
            .messages()
            .await
            .iter()
            .all(|m| m.synced_to_crm));
        assert!(store
            .webhook_logs()
            .await
            .iter()
            .all(|l| l.status == WebhookStatus::Success));

        // Second pass finds nothing to do
        job.run_once().await;
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
