use crate::error::{GatewayError, Result};
use crate::types::{
    Group, Message, MessageInput, MessageStatus, Organization, Session, SessionStatus, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Row subset returned by `list_restorable_sessions`: just enough to bring a
/// session back up after a restart.
#[derive(Debug, Clone)]
pub struct RestorableSession {
    pub session_id: String,
    pub org_id: Uuid,
    pub auth_state: serde_json::Value,
    pub phone_number: Option<String>,
}

/// Counter increments for one usage upsert. Fields default to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub messages_sent: i64,
    pub messages_received: i64,
    pub active_sessions: i64,
    pub api_calls: i64,
}

impl UsageDelta {
    pub fn sent() -> Self {
        Self {
            messages_sent: 1,
            ..Default::default()
        }
    }

    pub fn received() -> Self {
        Self {
            messages_received: 1,
            ..Default::default()
        }
    }

    pub fn session_active() -> Self {
        Self {
            active_sessions: 1,
            ..Default::default()
        }
    }

    pub fn api_call() -> Self {
        Self {
            api_calls: 1,
            ..Default::default()
        }
    }
}

/// Durable record store behind every component. Callers never see SQL; tests
/// run against [`MemoryStore`], production against the sqlite implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // Organizations
    async fn create_organization(&self, org: &Organization) -> Result<()>;
    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>>;
    async fn find_org_by_token(&self, token: &str) -> Result<Option<Organization>>;
    async fn list_organizations(&self) -> Result<Vec<Organization>>;

    // Sessions
    async fn create_session(&self, session_id: &str, org_id: Uuid) -> Result<Session>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;
    async fn list_sessions_for_org(&self, org_id: Uuid) -> Result<Vec<Session>>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn load_auth_state(&self, session_id: &str) -> Result<Option<serde_json::Value>>;
    /// Idempotent full overwrite, atomic w.r.t. concurrent readers.
    async fn save_auth_state(&self, session_id: &str, blob: &serde_json::Value) -> Result<()>;

    /// Updates `last_seen_at`. A `None` phone number leaves the stored one
    /// unchanged.
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        phone_number: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn save_qr_code(&self, session_id: &str, qr: &str) -> Result<()>;

    /// Every session with status in {connected, connecting} and a non-null
    /// auth state.
    async fn list_restorable_sessions(&self) -> Result<Vec<RestorableSession>>;

    /// Returns the new attempt count.
    async fn increment_reconnect_attempts(&self, session_id: &str) -> Result<i64>;
    async fn reset_reconnect_attempts(&self, session_id: &str) -> Result<()>;

    /// Sessions not in `error`, for the account limit check.
    async fn count_active_sessions(&self, org_id: Uuid) -> Result<i64>;

    // Messages
    /// Insert; fails with `Validation` on duplicate `(message_id, session_id)`.
    async fn save_message(&self, input: MessageInput) -> Result<Message>;
    async fn mark_message_synced(&self, id: Uuid, crm_message_id: Option<&str>) -> Result<()>;
    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()>;
    /// Inbound, not yet synced, not failed, oldest first.
    async fn list_pending_crm_sync(&self, org_id: Uuid, limit: i64) -> Result<Vec<Message>>;

    // Groups
    async fn upsert_group(&self, group: &Group) -> Result<()>;

    // Webhook audit
    async fn log_webhook(&self, log: &crate::types::WebhookLog) -> Result<()>;

    // Usage
    async fn increment_usage(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
    ) -> Result<()>;
    async fn get_usage(&self, org_id: Uuid, period_start: DateTime<Utc>) -> Result<UsageRecord>;
}

#[derive(Default)]
struct MemoryInner {
    orgs: HashMap<Uuid, Organization>,
    sessions: HashMap<String, Session>,
    messages: Vec<Message>,
    groups: HashMap<(String, String), Group>,
    webhook_logs: Vec<crate::types::WebhookLog>,
    usage: HashMap<(Uuid, DateTime<Utc>), UsageRecord>,
}

/// In-memory store for tests. Mirrors the sqlite implementation's semantics,
/// including the duplicate-message failure and restorable-session selection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All webhook log rows, for assertions.
    pub async fn webhook_logs(&self) -> Vec<crate::types::WebhookLog> {
        self.inner.lock().await.webhook_logs.clone()
    }

    /// All message rows, for assertions.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.orgs.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>> {
        Ok(self.inner.lock().await.orgs.get(&org_id).cloned())
    }

    async fn find_org_by_token(&self, token: &str) -> Result<Option<Organization>> {
        Ok(self
            .inner
            .lock()
            .await
            .orgs
            .values()
            .find(|o| o.api_token == token)
            .cloned())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        Ok(self.inner.lock().await.orgs.values().cloned().collect())
    }

    async fn create_session(&self, session_id: &str, org_id: Uuid) -> Result<Session> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(session_id) {
            return Err(GatewayError::validation(format!(
                "session {} already exists",
                session_id
            )));
        }
        let session = Session {
            session_id: session_id.to_string(),
            org_id,
            status: SessionStatus::Connecting,
            phone_number: None,
            auth_state: None,
            last_qr: None,
            last_seen_at: None,
            error_message: None,
            reconnect_attempts: 0,
            created_at: Utc::now(),
        };
        inner.sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions_for_org(&self, org_id: Uuid) -> Result<Vec<Session>> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.inner.lock().await.sessions.remove(session_id);
        Ok(())
    }

    async fn load_auth_state(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        Ok(session.auth_state.clone())
    }

    async fn save_auth_state(&self, session_id: &str, blob: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        session.auth_state = Some(blob.clone());
        Ok(())
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        phone_number: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        session.status = status;
        if let Some(phone) = phone_number {
            session.phone_number = Some(phone.to_string());
        }
        session.error_message = error_message.map(|s| s.to_string());
        session.last_seen_at = Some(Utc::now());
        Ok(())
    }

    async fn save_qr_code(&self, session_id: &str, qr: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        session.last_qr = Some(qr.to_string());
        Ok(())
    }

    async fn list_restorable_sessions(&self) -> Result<Vec<RestorableSession>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    SessionStatus::Connected | SessionStatus::Connecting
                ) && s.auth_state.is_some()
            })
            .map(|s| RestorableSession {
                session_id: s.session_id.clone(),
                org_id: s.org_id,
                auth_state: s.auth_state.clone().unwrap_or_default(),
                phone_number: s.phone_number.clone(),
            })
            .collect())
    }

    async fn increment_reconnect_attempts(&self, session_id: &str) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        session.reconnect_attempts += 1;
        Ok(session.reconnect_attempts)
    }

    async fn reset_reconnect_attempts(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        session.reconnect_attempts = 0;
        Ok(())
    }

    async fn count_active_sessions(&self, org_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.org_id == org_id && s.status != SessionStatus::Error)
            .count() as i64)
    }

    async fn save_message(&self, input: MessageInput) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        if inner
            .messages
            .iter()
            .any(|m| m.message_id == input.message_id && m.session_id == input.session_id)
        {
            return Err(GatewayError::validation(format!(
                "duplicate message {} in session {}",
                input.message_id, input.session_id
            )));
        }
        let message = Message {
            id: Uuid::new_v4(),
            session_id: input.session_id,
            org_id: input.org_id,
            message_id: input.message_id,
            direction: input.direction,
            from_number: input.from_number,
            to_number: input.to_number,
            message_type: input.message_type,
            content: input.content,
            status: input.status,
            is_group_message: input.is_group_message,
            group_jid: input.group_jid,
            synced_to_crm: false,
            crm_message_id: None,
            timestamp: input.timestamp,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn mark_message_synced(&self, id: Uuid, crm_message_id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        message.synced_to_crm = true;
        message.crm_message_id = crm_message_id.map(|s| s.to_string());
        Ok(())
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        message.status = status;
        Ok(())
    }

    async fn list_pending_crm_sync(&self, org_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| {
                m.org_id == org_id
                    && m.direction == crate::types::MessageDirection::Inbound
                    && !m.synced_to_crm
                    && m.status != MessageStatus::Failed
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn upsert_group(&self, group: &Group) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.groups.insert(
            (group.session_id.clone(), group.group_jid.clone()),
            group.clone(),
        );
        Ok(())
    }

    async fn log_webhook(&self, log: &crate::types::WebhookLog) -> Result<()> {
        self.inner.lock().await.webhook_logs.push(log.clone());
        Ok(())
    }

    async fn increment_usage(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.usage.entry((org_id, period_start)).or_default();
        record.messages_sent += delta.messages_sent;
        record.messages_received += delta.messages_received;
        record.active_sessions += delta.active_sessions;
        record.api_calls += delta.api_calls;
        Ok(())
    }

    async fn get_usage(&self, org_id: Uuid, period_start: DateTime<Utc>) -> Result<UsageRecord> {
        let inner = self.inner.lock().await;
        Ok(inner
            .usage
            .get(&(org_id, period_start))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageDirection;

    fn org() -> Organization {
        Organization {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            name: "Test Org".to_string(),
            tier: crate::types::SubscriptionTier::Free,
            max_accounts: 1,
            max_messages_per_month: 100,
            api_token: "tok".to_string(),
            webhook_url: None,
            crm_api_key: None,
            crm_location_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_session_starts_connecting() {
        let store = MemoryStore::new();
        let session = store.create_session("s1", Uuid::new_v4()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Connecting);
        assert_eq!(session.reconnect_attempts, 0);
        assert!(store.create_session("s1", Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_status_update_keeps_phone_on_none() {
        let store = MemoryStore::new();
        store.create_session("s1", Uuid::new_v4()).await.unwrap();
        store
            .update_session_status("s1", SessionStatus::Connected, Some("5551234567"), None)
            .await
            .unwrap();
        store
            .update_session_status("s1", SessionStatus::Disconnected, None, None)
            .await
            .unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.phone_number.as_deref(), Some("5551234567"));
        assert!(session.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_restorable_selection() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        for (id, status, with_auth) in [
            ("connected", SessionStatus::Connected, true),
            ("connecting", SessionStatus::Connecting, true),
            ("no-auth", SessionStatus::Connected, false),
            ("errored", SessionStatus::Error, true),
        ] {
            store.create_session(id, org_id).await.unwrap();
            if with_auth {
                store
                    .save_auth_state(id, &serde_json::json!({"creds": id}))
                    .await
                    .unwrap();
            }
            store
                .update_session_status(id, status, None, None)
                .await
                .unwrap();
        }

        let mut restorable: Vec<String> = store
            .list_restorable_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        restorable.sort();
        assert_eq!(restorable, vec!["connected", "connecting"]);
    }

    #[tokio::test]
    async fn test_duplicate_message_rejected() {
        let store = MemoryStore::new();
        let org = org();
        let input = MessageInput::text(
            "s1",
            org.id,
            "m1",
            MessageDirection::Inbound,
            "+555",
            "+666",
            "hi",
        );
        store.save_message(input.clone()).await.unwrap();
        assert!(matches!(
            store.save_message(input).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_crm_sync_filters_and_orders() {
        let store = MemoryStore::new();
        let org = org();

        let first = store
            .save_message(MessageInput::text(
                "s1",
                org.id,
                "m1",
                MessageDirection::Inbound,
                "+1",
                "+2",
                "first",
            ))
            .await
            .unwrap();
        let synced = store
            .save_message(MessageInput::text(
                "s1",
                org.id,
                "m2",
                MessageDirection::Inbound,
                "+1",
                "+2",
                "synced",
            ))
            .await
            .unwrap();
        store.mark_message_synced(synced.id, Some("crm-1")).await.unwrap();
        // Outbound never shows up in the backfill
        store
            .save_message(MessageInput::text(
                "s1",
                org.id,
                "m3",
                MessageDirection::Outbound,
                "+2",
                "+1",
                "out",
            ))
            .await
            .unwrap();

        let pending = store.list_pending_crm_sync(org.id, 100).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    #[tokio::test]
    async fn test_usage_upsert_accumulates() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let period = crate::types::period_start(Utc::now());
        store
            .increment_usage(org_id, period, UsageDelta::received())
            .await
            .unwrap();
        store
            .increment_usage(org_id, period, UsageDelta::received())
            .await
            .unwrap();
        store
            .increment_usage(org_id, period, UsageDelta::sent())
            .await
            .unwrap();
        let usage = store.get_usage(org_id, period).await.unwrap();
        assert_eq!(usage.messages_received, 2);
        assert_eq!(usage.messages_sent, 1);
    }
}
