use crate::error::{GatewayError, LimitKind, Result};
use crate::store::SessionStore;
use crate::types::{period_start, Organization};
use chrono::Utc;
use std::sync::Arc;

/// Advisory pre-checks against the org's subscription caps. These reject at
/// the API edge only; established sessions are never policed mid-send.
#[derive(Clone)]
pub struct LimitGuard {
    store: Arc<dyn SessionStore>,
}

impl LimitGuard {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Before a session create: count of non-error sessions vs `max_accounts`.
    pub async fn check_account_limit(&self, org: &Organization) -> Result<()> {
        let current = self.store.count_active_sessions(org.id).await?;
        if current >= org.max_accounts {
            return Err(GatewayError::LimitExceeded {
                kind: LimitKind::Accounts,
                current,
                limit: org.max_accounts,
            });
        }
        Ok(())
    }

    /// Before a send batch: current-month total vs `max_messages_per_month`.
    /// `batch` is how many messages the caller is about to enqueue.
    pub async fn check_message_limit(&self, org: &Organization, batch: i64) -> Result<()> {
        let usage = self
            .store
            .get_usage(org.id, period_start(Utc::now()))
            .await?;
        let current = usage.messages_sent + usage.messages_received;
        if current + batch > org.max_messages_per_month {
            return Err(GatewayError::LimitExceeded {
                kind: LimitKind::Messages,
                current,
                limit: org.max_messages_per_month,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{SessionStatus, SubscriptionTier};
    use uuid::Uuid;

    fn org(max_accounts: i64, max_messages: i64) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            name: "Test Org".to_string(),
            tier: SubscriptionTier::Free,
            max_accounts,
            max_messages_per_month: max_messages,
            api_token: "tok".to_string(),
            webhook_url: None,
            crm_api_key: None,
            crm_location_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_account_limit_counts_non_error_sessions() {
        let store = Arc::new(MemoryStore::new());
        let guard = LimitGuard::new(store.clone());
        let org = org(1, 100);

        assert!(guard.check_account_limit(&org).await.is_ok());

        store.create_session("s1", org.id).await.unwrap();
        store
            .update_session_status("s1", SessionStatus::Connected, Some("555"), None)
            .await
            .unwrap();

        let err = guard.check_account_limit(&org).await.unwrap_err();
        match err {
            GatewayError::LimitExceeded {
                kind,
                current,
                limit,
            } => {
                assert_eq!(kind, LimitKind::Accounts);
                assert_eq!(current, 1);
                assert_eq!(limit, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Errored sessions free up the slot
        store
            .update_session_status("s1", SessionStatus::Error, None, Some("gone"))
            .await
            .unwrap();
        assert!(guard.check_account_limit(&org).await.is_ok());
    }

    #[tokio::test]
    async fn test_message_limit_includes_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let guard = LimitGuard::new(store.clone());
        let org = org(1, 10);

        store
            .increment_usage(
                org.id,
                period_start(Utc::now()),
                crate::store::UsageDelta {
                    messages_sent: 8,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(guard.check_message_limit(&org, 2).await.is_ok());
        assert!(guard.check_message_limit(&org, 3).await.is_err());
    }
}
