use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;
use wabridge_core::error::{GatewayError, Result};
use wabridge_core::store::{RestorableSession, SessionStore, UsageDelta};
use wabridge_core::types::{
    Group, Message, MessageDirection, MessageInput, MessageStatus, Organization, Session,
    SessionStatus, SubscriptionTier, UsageRecord, WebhookLog,
};

/// Sqlite-backed [`SessionStore`]. Row-level atomicity for upserts comes from
/// single-statement `ON CONFLICT` updates.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        info!("SqliteStore initialized");
        Ok(Self { pool })
    }
}

/// Unique-constraint violations are caller errors (duplicate message, taken
/// session id); pool/io problems are transient; the rest is fatal.
fn map_sqlx(e: sqlx::Error) -> GatewayError {
    match &e {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            GatewayError::validation(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => GatewayError::transient(e.to_string()),
        sqlx::Error::RowNotFound => GatewayError::NotFound(e.to_string()),
        _ => GatewayError::fatal(e.to_string()),
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| GatewayError::fatal(format!("bad uuid in row: {e}")))
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn tier_from_str(raw: &str) -> SubscriptionTier {
    match raw {
        "starter" => SubscriptionTier::Starter,
        "pro" => SubscriptionTier::Pro,
        "enterprise" => SubscriptionTier::Enterprise,
        _ => SubscriptionTier::Free,
    }
}

fn tier_to_str(tier: SubscriptionTier) -> &'static str {
    match tier {
        SubscriptionTier::Free => "free",
        SubscriptionTier::Starter => "starter",
        SubscriptionTier::Pro => "pro",
        SubscriptionTier::Enterprise => "enterprise",
    }
}

fn session_status_from_str(raw: &str) -> SessionStatus {
    match raw {
        "connected" => SessionStatus::Connected,
        "disconnected" => SessionStatus::Disconnected,
        "error" => SessionStatus::Error,
        _ => SessionStatus::Connecting,
    }
}

fn direction_from_str(raw: &str) -> MessageDirection {
    match raw {
        "outbound" => MessageDirection::Outbound,
        _ => MessageDirection::Inbound,
    }
}

fn direction_to_str(direction: MessageDirection) -> &'static str {
    match direction {
        MessageDirection::Inbound => "inbound",
        MessageDirection::Outbound => "outbound",
    }
}

fn message_status_from_str(raw: &str) -> MessageStatus {
    match raw {
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}

fn message_status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "pending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn webhook_status_to_str(status: wabridge_core::types::WebhookStatus) -> &'static str {
    use wabridge_core::types::WebhookStatus;
    match status {
        WebhookStatus::Pending => "pending",
        WebhookStatus::Success => "success",
        WebhookStatus::Failed => "failed",
        WebhookStatus::Retrying => "retrying",
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        session_id: row.get("session_id"),
        org_id: parse_uuid(row.get("org_id"))?,
        status: session_status_from_str(row.get("status")),
        phone_number: row.get("phone_number"),
        auth_state: row
            .get::<Option<String>, _>("auth_state")
            .map(|raw| parse_json(&raw)),
        last_qr: row.get("last_qr"),
        last_seen_at: row.get("last_seen_at"),
        error_message: row.get("error_message"),
        reconnect_attempts: row.get("reconnect_attempts"),
        created_at: row.get("created_at"),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    Ok(Message {
        id: parse_uuid(row.get("id"))?,
        session_id: row.get("session_id"),
        org_id: parse_uuid(row.get("org_id"))?,
        message_id: row.get("message_id"),
        direction: direction_from_str(row.get("direction")),
        from_number: row.get("from_number"),
        to_number: row.get("to_number"),
        message_type: row.get("message_type"),
        content: parse_json(row.get("content")),
        status: message_status_from_str(row.get("status")),
        is_group_message: row.get("is_group_message"),
        group_jid: row.get("group_jid"),
        synced_to_crm: row.get("synced_to_crm"),
        crm_message_id: row.get("crm_message_id"),
        timestamp: row.get("timestamp"),
    })
}

fn row_to_org(row: &sqlx::sqlite::SqliteRow) -> Result<Organization> {
    Ok(Organization {
        id: parse_uuid(row.get("id"))?,
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        tier: tier_from_str(row.get("tier")),
        max_accounts: row.get("max_accounts"),
        max_messages_per_month: row.get("max_messages_per_month"),
        api_token: row.get("api_token"),
        webhook_url: row.get("webhook_url"),
        crm_api_key: row.get("crm_api_key"),
        crm_location_id: row.get("crm_location_id"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    #[instrument(skip(self, org))]
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations
                (id, owner_id, name, tier, max_accounts, max_messages_per_month,
                 api_token, webhook_url, crm_api_key, crm_location_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(org.id.to_string())
        .bind(&org.owner_id)
        .bind(&org.name)
        .bind(tier_to_str(org.tier))
        .bind(org.max_accounts)
        .bind(org.max_messages_per_month)
        .bind(&org.api_token)
        .bind(&org.webhook_url)
        .bind(&org.crm_api_key)
        .bind(&org.crm_location_id)
        .bind(org.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = ?")
            .bind(org_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn find_org_by_token(&self, token: &str) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE api_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        let rows = sqlx::query("SELECT * FROM organizations ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_org).collect()
    }

    #[instrument(skip(self))]
    async fn create_session(&self, session_id: &str, org_id: Uuid) -> Result<Session> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_sessions (session_id, org_id, status, created_at)
            VALUES (?, ?, 'connecting', ?)
            "#,
        )
        .bind(session_id)
        .bind(org_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        self.get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::fatal("session vanished after insert"))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM whatsapp_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_sessions_for_org(&self, org_id: Uuid) -> Result<Vec<Session>> {
        let rows =
            sqlx::query("SELECT * FROM whatsapp_sessions WHERE org_id = ? ORDER BY created_at")
                .bind(org_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
        rows.iter().map(row_to_session).collect()
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM whatsapp_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_auth_state(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT auth_state FROM whatsapp_sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
        match row {
            None => Err(GatewayError::NotFound(session_id.to_string())),
            Some((raw,)) => Ok(raw.map(|r| parse_json(&r))),
        }
    }

    #[instrument(skip(self, blob))]
    async fn save_auth_state(&self, session_id: &str, blob: &serde_json::Value) -> Result<()> {
        let result = sqlx::query("UPDATE whatsapp_sessions SET auth_state = ? WHERE session_id = ?")
            .bind(blob.to_string())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        phone_number: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        // COALESCE keeps the stored phone number when the caller passes None
        let result = sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET status = ?,
                phone_number = COALESCE(?, phone_number),
                error_message = ?,
                last_seen_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(phone_number)
        .bind(error_message)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn save_qr_code(&self, session_id: &str, qr: &str) -> Result<()> {
        let result = sqlx::query("UPDATE whatsapp_sessions SET last_qr = ? WHERE session_id = ?")
            .bind(qr)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn list_restorable_sessions(&self) -> Result<Vec<RestorableSession>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, org_id, auth_state, phone_number
            FROM whatsapp_sessions
            WHERE status IN ('connected', 'connecting') AND auth_state IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(RestorableSession {
                    session_id: row.get("session_id"),
                    org_id: parse_uuid(row.get("org_id"))?,
                    auth_state: parse_json(row.get("auth_state")),
                    phone_number: row.get("phone_number"),
                })
            })
            .collect()
    }

    async fn increment_reconnect_attempts(&self, session_id: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE whatsapp_sessions
            SET reconnect_attempts = reconnect_attempts + 1
            WHERE session_id = ?
            RETURNING reconnect_attempts
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|(n,)| n)
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))
    }

    async fn reset_reconnect_attempts(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE whatsapp_sessions SET reconnect_attempts = 0 WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn count_active_sessions(&self, org_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM whatsapp_sessions WHERE org_id = ? AND status != 'error'",
        )
        .bind(org_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(count)
    }

    #[instrument(skip(self, input), fields(session_id = %input.session_id, message_id = %input.message_id))]
    async fn save_message(&self, input: MessageInput) -> Result<Message> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, session_id, org_id, message_id, direction, from_number, to_number,
                 message_type, content, status, is_group_message, group_jid,
                 synced_to_crm, crm_message_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&input.session_id)
        .bind(input.org_id.to_string())
        .bind(&input.message_id)
        .bind(direction_to_str(input.direction))
        .bind(&input.from_number)
        .bind(&input.to_number)
        .bind(&input.message_type)
        .bind(input.content.to_string())
        .bind(message_status_to_str(input.status))
        .bind(input.is_group_message)
        .bind(&input.group_jid)
        .bind(input.timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row_to_message(&row)
    }

    async fn mark_message_synced(&self, id: Uuid, crm_message_id: Option<&str>) -> Result<()> {
        let result =
            sqlx::query("UPDATE messages SET synced_to_crm = 1, crm_message_id = ? WHERE id = ?")
                .bind(crm_message_id)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(message_status_to_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_pending_crm_sync(&self, org_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE org_id = ? AND direction = 'inbound'
              AND synced_to_crm = 0 AND status != 'failed'
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(org_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_message).collect()
    }

    async fn upsert_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO groups
                (session_id, group_jid, name, description, participant_count, is_admin, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_id, group_jid) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                participant_count = excluded.participant_count,
                is_admin = excluded.is_admin,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&group.session_id)
        .bind(&group.group_jid)
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.participant_count)
        .bind(group.is_admin)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn log_webhook(&self, log: &WebhookLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs
                (id, org_id, message_id, url, payload, http_status, response_body,
                 retry_count, status, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.org_id.to_string())
        .bind(log.message_id.to_string())
        .bind(&log.url)
        .bind(log.payload.to_string())
        .bind(log.http_status.map(|s| s as i64))
        .bind(&log.response_body)
        .bind(log.retry_count)
        .bind(webhook_status_to_str(log.status))
        .bind(&log.error_message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        delta: UsageDelta,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records
                (org_id, period_start, messages_sent, messages_received, active_sessions, api_calls)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (org_id, period_start) DO UPDATE SET
                messages_sent = messages_sent + excluded.messages_sent,
                messages_received = messages_received + excluded.messages_received,
                active_sessions = active_sessions + excluded.active_sessions,
                api_calls = api_calls + excluded.api_calls
            "#,
        )
        .bind(org_id.to_string())
        .bind(period_start)
        .bind(delta.messages_sent)
        .bind(delta.messages_received)
        .bind(delta.active_sessions)
        .bind(delta.api_calls)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_usage(&self, org_id: Uuid, period_start: DateTime<Utc>) -> Result<UsageRecord> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT messages_sent, messages_received, active_sessions, api_calls
            FROM usage_records
            WHERE org_id = ? AND period_start = ?
            "#,
        )
        .bind(org_id.to_string())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row
            .map(
                |(messages_sent, messages_received, active_sessions, api_calls)| UsageRecord {
                    messages_sent,
                    messages_received,
                    active_sessions,
                    api_calls,
                },
            )
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabridge_core::types::period_start;

    // A file-backed db per test: a pooled `sqlite::memory:` would hand each
    // connection its own empty database.
    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db?mode=rwc", dir.path().display());
        (SqliteStore::new(&url).await.unwrap(), dir)
    }

    fn org() -> Organization {
        Organization {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4().to_string(),
            name: "Acme".to_string(),
            tier: SubscriptionTier::Starter,
            max_accounts: 3,
            max_messages_per_month: 1000,
            api_token: Uuid::new_v4().to_string(),
            webhook_url: Some("https://hook.test/in".to_string()),
            crm_api_key: None,
            crm_location_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();

        let created = store.create_session("s1", org.id).await.unwrap();
        assert_eq!(created.status, SessionStatus::Connecting);

        // duplicate id fails cleanly
        assert!(matches!(
            store.create_session("s1", org.id).await,
            Err(GatewayError::Validation(_))
        ));

        store
            .update_session_status("s1", SessionStatus::Connected, Some("5551234567"), None)
            .await
            .unwrap();
        // None keeps the phone number
        store
            .update_session_status("s1", SessionStatus::Disconnected, None, None)
            .await
            .unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.phone_number.as_deref(), Some("5551234567"));
        assert_eq!(session.status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_auth_state_round_trip_and_restorable() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();
        store.create_session("s2", org.id).await.unwrap();

        let blob = serde_json::json!({
            "client_token": "ct",
            "enc_key": { "$bytes": "AAECAwQ=" }
        });
        store.save_auth_state("s2", &blob).await.unwrap();
        let loaded = store.load_auth_state("s2").await.unwrap().unwrap();
        assert_eq!(loaded, blob);

        store
            .update_session_status("s2", SessionStatus::Connected, Some("555"), None)
            .await
            .unwrap();
        let restorable = store.list_restorable_sessions().await.unwrap();
        assert_eq!(restorable.len(), 1);
        assert_eq!(restorable[0].session_id, "s2");
        assert_eq!(restorable[0].auth_state, blob);

        // Errored sessions drop out
        store
            .update_session_status("s2", SessionStatus::Error, None, Some("dead"))
            .await
            .unwrap();
        assert!(store.list_restorable_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_message_rejected() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();
        store.create_session("s3", org.id).await.unwrap();

        let input = MessageInput::text(
            "s3",
            org.id,
            "wamid.1",
            MessageDirection::Inbound,
            "+5551234567",
            "+5559999999",
            "hi",
        );
        let saved = store.save_message(input.clone()).await.unwrap();
        assert!(!saved.synced_to_crm);
        assert!(matches!(
            store.save_message(input).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_sync_and_mark_synced() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();
        store.create_session("s4", org.id).await.unwrap();

        let saved = store
            .save_message(MessageInput::text(
                "s4",
                org.id,
                "wamid.2",
                MessageDirection::Inbound,
                "+1",
                "+2",
                "hello",
            ))
            .await
            .unwrap();

        let pending = store.list_pending_crm_sync(org.id, 100).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .mark_message_synced(saved.id, Some("crm-77"))
            .await
            .unwrap();
        assert!(store.list_pending_crm_sync(org.id, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_upsert() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();
        let period = period_start(Utc::now());

        store
            .increment_usage(org.id, period, UsageDelta::received())
            .await
            .unwrap();
        store
            .increment_usage(org.id, period, UsageDelta::received())
            .await
            .unwrap();
        store
            .increment_usage(org.id, period, UsageDelta::sent())
            .await
            .unwrap();

        let usage = store.get_usage(org.id, period).await.unwrap();
        assert_eq!(usage.messages_received, 2);
        assert_eq!(usage.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_reconnect_counter() {
        let (store, _dir) = store().await;
        let org = org();
        store.create_organization(&org).await.unwrap();
        store.create_session("s5", org.id).await.unwrap();

        assert_eq!(store.increment_reconnect_attempts("s5").await.unwrap(), 1);
        assert_eq!(store.increment_reconnect_attempts("s5").await.unwrap(), 2);
        store.reset_reconnect_attempts("s5").await.unwrap();
        let session = store.get_session("s5").await.unwrap().unwrap();
        assert_eq!(session.reconnect_attempts, 0);
    }
}
