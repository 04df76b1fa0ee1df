use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

/// Tenant record. One per owner; sessions, messages and usage hang off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub tier: SubscriptionTier,
    pub max_accounts: i64,
    pub max_messages_per_month: i64,
    /// Bearer credential for the HTTP edge. Verified by store lookup.
    pub api_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// CRM API key, sent as `Authorization: Bearer` on webhook deliveries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm_api_key: Option<String>,
    /// CRM location id, sent as `X-Location-Id` on webhook deliveries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm_location_id: Option<String>,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }
}

/// Durable record of one WhatsApp client session.
///
/// `auth_state` is the opaque credential bundle from the client library and
/// never leaves the process boundary (skipped on serialization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub org_id: Uuid,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip)]
    pub auth_state: Option<serde_json::Value>,
    #[serde(skip)]
    pub last_qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub reconnect_attempts: i64,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
}

pub const SESSION_ID_MAX_LEN: usize = 100;

/// Session ids are opaque but constrained: ≤100 chars of `[A-Za-z0-9_-]`.
pub fn validate_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= SESSION_ID_MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: String,
    pub org_id: Uuid,
    /// External id assigned by the WhatsApp library. Unique per session.
    pub message_id: String,
    pub direction: MessageDirection,
    pub from_number: String,
    pub to_number: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_group_message: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_jid: Option<String>,
    #[serde(default)]
    pub synced_to_crm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm_message_id: Option<String>,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Insert shape for `SessionStore::save_message`. The store assigns the row id.
#[derive(Debug, Clone)]
pub struct MessageInput {
    pub session_id: String,
    pub org_id: Uuid,
    pub message_id: String,
    pub direction: MessageDirection,
    pub from_number: String,
    pub to_number: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    pub is_group_message: bool,
    pub group_jid: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageInput {
    pub fn text(
        session_id: &str,
        org_id: Uuid,
        message_id: &str,
        direction: MessageDirection,
        from_number: &str,
        to_number: &str,
        body: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            org_id,
            message_id: message_id.to_string(),
            direction,
            from_number: from_number.to_string(),
            to_number: to_number.to_string(),
            message_type: default_message_type(),
            content: serde_json::json!({ "text": body }),
            status: match direction {
                MessageDirection::Inbound => MessageStatus::Delivered,
                MessageDirection::Outbound => MessageStatus::Sent,
            },
            is_group_message: false,
            group_jid: None,
            timestamp: Utc::now(),
        }
    }

    pub fn in_group(mut self, group_jid: &str) -> Self {
        self.is_group_message = true;
        self.group_jid = Some(group_jid.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub session_id: String,
    pub group_jid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub participant_count: i64,
    pub is_admin: bool,
    #[serde(default = "default_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

/// One delivery attempt against a tenant webhook. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub message_id: Uuid,
    pub url: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub retry_count: i64,
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Monthly counters per org. Keyed by `(org_id, period_start)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub messages_sent: i64,
    pub messages_received: i64,
    pub active_sessions: i64,
    pub api_calls: i64,
}

/// First day of the calendar month containing `at`, at midnight UTC.
pub fn period_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

fn default_message_type() -> String {
    "text".to_string()
}
