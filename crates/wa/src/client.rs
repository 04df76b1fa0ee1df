use crate::auth::AuthState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why the socket closed. `LoggedOut` is the explicit enum value from the
/// underlying library and means the credentials are dead; everything else is
/// eligible for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    RateLimited,
    ConnectionLost(String),
}

/// Batch classification from the client library. Only `Notify` batches carry
/// fresh traffic; the rest are history syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBatchKind {
    Notify,
    History,
    Append,
    Replace,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// External id assigned by the library.
    pub message_id: String,
    pub from_jid: String,
    pub to_jid: String,
    pub text: String,
    pub group_jid: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GroupParticipant {
    pub jid: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub group_jid: String,
    pub subject: String,
    pub description: Option<String>,
    pub participants: Vec<GroupParticipant>,
    /// Whether our own number holds admin in this group.
    pub we_are_admin: bool,
}

/// Event stream surfaced by a live client connection.
#[derive(Debug, Clone)]
pub enum WaEvent {
    Qr(String),
    CredsUpdate(AuthState),
    Open { phone_number: String },
    Close { reason: DisconnectReason },
    Messages {
        kind: MessageBatchKind,
        messages: Vec<InboundMessage>,
    },
    GroupUpdate(GroupMetadata),
}

/// Handle to one live WhatsApp-Web connection. Send operations require the
/// connection to be open; the library reports everything else through the
/// event stream handed out at connect time.
#[async_trait]
pub trait WaClient: Send + Sync {
    /// Send a text message. Returns the external message id.
    async fn send_text(&self, jid: &str, text: &str) -> anyhow::Result<String>;

    /// Invalidate the session server-side. A failure here usually means the
    /// socket is already dead, which callers may ignore.
    async fn logout(&self) -> anyhow::Result<()>;

    async fn create_group(
        &self,
        subject: &str,
        participants: &[String],
    ) -> anyhow::Result<GroupMetadata>;
    async fn list_groups(&self) -> anyhow::Result<Vec<GroupMetadata>>;
    async fn group_metadata(&self, group_jid: &str) -> anyhow::Result<GroupMetadata>;
    async fn add_participants(&self, group_jid: &str, participants: &[String])
        -> anyhow::Result<()>;
    async fn remove_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()>;
    async fn promote_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()>;
    async fn demote_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()>;
    async fn leave_group(&self, group_jid: &str) -> anyhow::Result<()>;
    /// `announce_only` restricts posting to admins.
    async fn update_group_settings(&self, group_jid: &str, announce_only: bool)
        -> anyhow::Result<()>;
}

/// Factory seam over the client library. Production wires the real library;
/// tests wire [`crate::stub::StubConnector`].
#[async_trait]
pub trait WaConnector: Send + Sync {
    /// Open a connection for `session_id`, seeded from `auth` when present
    /// (otherwise the library starts a fresh QR pairing). `storage_dir` is
    /// the library's file-backed auth directory for this session.
    async fn connect(
        &self,
        session_id: &str,
        auth: Option<AuthState>,
        storage_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn WaClient>, mpsc::Receiver<WaEvent>)>;
}
