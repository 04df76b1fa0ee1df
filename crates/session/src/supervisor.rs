use crate::reconnect::{ReconnectConfig, ReconnectController};
use crate::registry::{SessionHandle, SessionRegistry};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wabridge_core::bus::{EventBus, SessionEvent};
use wabridge_core::error::{GatewayError, Result};
use wabridge_core::phone::{is_group_jid, normalize_phone, to_jid};
use wabridge_core::store::SessionStore;
use wabridge_core::types::{
    validate_session_id, Group, Message, MessageDirection, MessageInput, MessageStatus,
    SessionStatus,
};
use wabridge_core::usage::UsageMeter;
use wabridge_wa::{
    AuthState, DisconnectReason, GroupMetadata, InboundMessage, MessageBatchKind, WaConnector,
    WaEvent,
};

/// Local retry budget for group and metadata calls against the client.
const CLIENT_OP_ATTEMPTS: u32 = 3;
const CLIENT_OP_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

fn group_record(session_id: &str, meta: &GroupMetadata) -> Group {
    Group {
        session_id: session_id.to_string(),
        group_jid: meta.group_jid.clone(),
        name: meta.subject.clone(),
        description: meta.description.clone(),
        participant_count: meta.participants.len() as i64,
        is_admin: meta.we_are_admin,
        updated_at: Utc::now(),
    }
}

/// Downstream consumer of persisted inbound messages (the webhook pipeline).
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, message: Message);
}

/// Sink used when no webhook pipeline is wired (tests, tooling).
pub struct NoopSink;

#[async_trait]
impl InboundSink for NoopSink {
    async fn deliver(&self, _message: Message) {}
}

/// Owns every live WhatsApp session end-to-end: creation, restoration,
/// event consumption, sending, teardown. Client events for one session are
/// consumed by a single task, so they are handled in arrival order and never
/// concurrently with each other.
pub struct Supervisor {
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn WaConnector>,
    registry: SessionRegistry,
    bus: Arc<EventBus>,
    sink: Arc<dyn InboundSink>,
    meter: UsageMeter,
    reconnect: Arc<ReconnectController>,
    storage_root: PathBuf,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn WaConnector>,
        bus: Arc<EventBus>,
        sink: Arc<dyn InboundSink>,
        reconnect: ReconnectConfig,
        storage_root: PathBuf,
    ) -> Arc<Self> {
        let meter = UsageMeter::new(store.clone());
        let reconnect = Arc::new(ReconnectController::new(reconnect, store.clone()));
        Arc::new(Self {
            store,
            connector,
            registry: SessionRegistry::new(),
            bus,
            sink,
            meter,
            reconnect,
            storage_root,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn reconnect(&self) -> &Arc<ReconnectController> {
        &self.reconnect
    }

    /// Create a brand-new session: DB row first, then the live connection.
    pub async fn create_session(self: &Arc<Self>, session_id: &str, org_id: Uuid) -> Result<()> {
        if !validate_session_id(session_id) {
            return Err(GatewayError::validation(format!(
                "invalid session id: {:?}",
                session_id
            )));
        }
        if self.registry.contains(session_id).await {
            return Err(GatewayError::validation(format!(
                "session {} is already registered",
                session_id
            )));
        }
        self.store.create_session(session_id, org_id).await?;
        self.start_session(session_id, org_id, None).await
    }

    /// Bring every restorable session back up. Per-session failures flip that
    /// session to `error` and leave the rest alone.
    pub async fn restore_all(self: &Arc<Self>) {
        let restorable = match self.store.list_restorable_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list restorable sessions");
                return;
            }
        };

        info!(count = restorable.len(), "restoring sessions");
        for row in restorable {
            let auth = match AuthState::from_value(&row.auth_state) {
                Ok(auth) => Some(auth),
                Err(e) => {
                    warn!(session_id = %row.session_id, error = %e, "auth state unreadable, starting fresh pairing");
                    None
                }
            };
            if let Err(e) = self
                .start_session(&row.session_id, row.org_id, auth)
                .await
            {
                error!(session_id = %row.session_id, error = %e, "restore failed");
                let _ = self
                    .store
                    .update_session_status(
                        &row.session_id,
                        SessionStatus::Error,
                        None,
                        Some(&e.to_string()),
                    )
                    .await;
            }
        }
    }

    /// Tear down and reconnect with the stored auth state. Driven by the
    /// reconnection controller.
    pub async fn recreate_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        if let Some(handle) = self.registry.deregister(session_id).await {
            if let Some(consumer) = handle.consumer {
                consumer.abort();
            }
        }
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;
        let auth = session
            .auth_state
            .as_ref()
            .and_then(|blob| AuthState::from_value(blob).ok());
        self.start_session(session_id, session.org_id, auth).await
    }

    async fn start_session(
        self: &Arc<Self>,
        session_id: &str,
        org_id: Uuid,
        auth: Option<AuthState>,
    ) -> Result<()> {
        let storage_dir = self.storage_root.join(session_id);
        tokio::fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| GatewayError::transient(format!("session storage: {e}")))?;

        let (client, events) = self
            .connector
            .connect(session_id, auth, &storage_dir)
            .await
            .map_err(|e| GatewayError::transient(e.to_string()))?;

        self.registry
            .register(
                session_id,
                SessionHandle {
                    client,
                    org_id,
                    status: SessionStatus::Connecting,
                    phone_number: None,
                    created_at: Utc::now(),
                    consumer: None,
                },
            )
            .await?;

        let supervisor = self.clone();
        let id = session_id.to_string();
        let consumer = tokio::spawn(async move {
            supervisor.run_consumer(id, org_id, events).await;
        });
        self.registry.set_consumer(session_id, consumer).await;
        Ok(())
    }

    /// Terminal failure path: mark `error`, drop the live handle.
    pub async fn abandon_session(&self, session_id: &str, reason: &str) {
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Error, None, Some(reason))
            .await
        {
            warn!(session_id, error = %e, "failed to persist error status");
        }
        if let Some(handle) = self.registry.deregister(session_id).await {
            if let Some(consumer) = handle.consumer {
                consumer.abort();
            }
        }
        self.bus.publish(SessionEvent::ConnectionStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Error,
            phone_number: None,
        });
    }

    /// Logout, deregister, delete auth files and the session record.
    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        self.reconnect.cancel(session_id);
        if let Some(handle) = self.registry.deregister(session_id).await {
            // An already-dead socket is fine here
            if let Err(e) = handle.client.logout().await {
                debug!(session_id, error = %e, "logout on destroy failed");
            }
            if let Some(consumer) = handle.consumer {
                consumer.abort();
            }
        }
        let storage_dir = self.storage_root.join(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&storage_dir).await {
            debug!(session_id, error = %e, "no auth files to remove");
        }
        self.store.delete_session(session_id).await?;
        self.bus.publish(SessionEvent::ConnectionStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Disconnected,
            phone_number: None,
        });
        Ok(())
    }

    /// Send a text message. Requires a live, connected handle.
    pub async fn send_text(&self, session_id: &str, to: &str, body: &str) -> Result<Message> {
        let snapshot = self
            .registry
            .snapshot(session_id)
            .await
            .ok_or_else(|| GatewayError::NotConnected(session_id.to_string()))?;
        let client = self.registry.connected_client(session_id).await?;

        let jid = to_jid(to);
        let external_id = client
            .send_text(&jid, body)
            .await
            .map_err(|e| GatewayError::transient(e.to_string()))?;

        let mut input = MessageInput {
            session_id: session_id.to_string(),
            org_id: snapshot.org_id,
            message_id: external_id,
            direction: MessageDirection::Outbound,
            from_number: snapshot
                .phone_number
                .as_deref()
                .map(normalize_phone)
                .unwrap_or_default(),
            to_number: normalize_phone(&jid),
            message_type: "text".to_string(),
            content: serde_json::json!({ "text": body }),
            status: MessageStatus::Sent,
            is_group_message: false,
            group_jid: None,
            timestamp: Utc::now(),
        };
        if is_group_jid(&jid) {
            input.is_group_message = true;
            input.group_jid = Some(jid.clone());
        }

        let message = self.store.save_message(input).await?;
        if let Err(e) = self
            .meter
            .record_message(snapshot.org_id, MessageDirection::Outbound)
            .await
        {
            warn!(session_id, error = %e, "failed to meter outbound message");
        }
        Ok(message)
    }

    /// Run a client call with the local retry budget for transient failures.
    /// Sends are excluded: their retry cycle belongs to the outbound queue.
    async fn client_op<T, F, Fut>(&self, session_id: &str, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err = GatewayError::transient(e.to_string());
                    if !err.is_transient() {
                        return Err(err);
                    }
                    if attempt >= CLIENT_OP_ATTEMPTS {
                        warn!(session_id, op, attempt, error = %e, "client call failed, giving up");
                        return Err(GatewayError::fatal(format!(
                            "{op} failed after {attempt} attempts: {e}"
                        )));
                    }
                    debug!(session_id, op, attempt, error = %e, "client call failed, retrying");
                    tokio::time::sleep(CLIENT_OP_RETRY_DELAY).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn create_group(
        &self,
        session_id: &str,
        subject: &str,
        participants: &[String],
    ) -> Result<GroupMetadata> {
        let client = self.registry.connected_client(session_id).await?;
        let jids: Vec<String> = participants.iter().map(|p| to_jid(p)).collect();
        let meta = self
            .client_op(session_id, "create_group", || {
                client.create_group(subject, &jids)
            })
            .await?;
        self.upsert_group_record(session_id, &meta).await;
        Ok(meta)
    }

    pub async fn list_groups(&self, session_id: &str) -> Result<Vec<GroupMetadata>> {
        let client = self.registry.connected_client(session_id).await?;
        self.client_op(session_id, "list_groups", || client.list_groups())
            .await
    }

    pub async fn group_metadata(&self, session_id: &str, group_jid: &str) -> Result<GroupMetadata> {
        let client = self.registry.connected_client(session_id).await?;
        self.client_op(session_id, "group_metadata", || {
            client.group_metadata(group_jid)
        })
        .await
    }

    pub async fn add_participants(
        &self,
        session_id: &str,
        group_jid: &str,
        participants: &[String],
    ) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        let jids: Vec<String> = participants.iter().map(|p| to_jid(p)).collect();
        self.client_op(session_id, "add_participants", || {
            client.add_participants(group_jid, &jids)
        })
        .await
    }

    pub async fn remove_participant(
        &self,
        session_id: &str,
        group_jid: &str,
        participant: &str,
    ) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        let jid = to_jid(participant);
        self.client_op(session_id, "remove_participant", || {
            client.remove_participant(group_jid, &jid)
        })
        .await
    }

    pub async fn promote_participant(
        &self,
        session_id: &str,
        group_jid: &str,
        participant: &str,
    ) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        let jid = to_jid(participant);
        self.client_op(session_id, "promote_participant", || {
            client.promote_participant(group_jid, &jid)
        })
        .await
    }

    pub async fn demote_participant(
        &self,
        session_id: &str,
        group_jid: &str,
        participant: &str,
    ) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        let jid = to_jid(participant);
        self.client_op(session_id, "demote_participant", || {
            client.demote_participant(group_jid, &jid)
        })
        .await
    }

    pub async fn leave_group(&self, session_id: &str, group_jid: &str) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        self.client_op(session_id, "leave_group", || client.leave_group(group_jid))
            .await
    }

    pub async fn update_group_settings(
        &self,
        session_id: &str,
        group_jid: &str,
        announce_only: bool,
    ) -> Result<()> {
        let client = self.registry.connected_client(session_id).await?;
        self.client_op(session_id, "update_group_settings", || {
            client.update_group_settings(group_jid, announce_only)
        })
        .await
    }

    /// Send `body` to every group member individually. Returns how many
    /// sends succeeded.
    pub async fn broadcast_to_group(
        &self,
        session_id: &str,
        group_jid: &str,
        body: &str,
    ) -> Result<usize> {
        let meta = self.group_metadata(session_id, group_jid).await?;
        let own_number = self
            .registry
            .snapshot(session_id)
            .await
            .and_then(|s| s.phone_number)
            .map(|p| to_jid(&p));

        let mut delivered = 0;
        for participant in &meta.participants {
            if Some(&participant.jid) == own_number.as_ref() {
                continue;
            }
            match self.send_text(session_id, &participant.jid, body).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(session_id, participant = %participant.jid, error = %e, "broadcast send failed")
                }
            }
        }
        Ok(delivered)
    }

    async fn upsert_group_record(&self, session_id: &str, meta: &GroupMetadata) {
        let group = group_record(session_id, meta);
        if let Err(e) = self.store.upsert_group(&group).await {
            warn!(session_id, group_jid = %meta.group_jid, error = %e, "group upsert failed");
        }
    }

    async fn run_consumer(
        self: Arc<Self>,
        session_id: String,
        org_id: Uuid,
        mut events: mpsc::Receiver<WaEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                WaEvent::Qr(qr) => {
                    if let Err(e) = self.store.save_qr_code(&session_id, &qr).await {
                        warn!(session_id = %session_id, error = %e, "failed to persist QR");
                    }
                    self.bus.publish(SessionEvent::Qr {
                        session_id: session_id.clone(),
                        qr,
                    });
                }
                WaEvent::CredsUpdate(auth) => {
                    // Persist off the event path so a slow write never
                    // stalls the stream
                    let store = self.store.clone();
                    let id = session_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store.save_auth_state(&id, &auth.to_value()).await {
                            error!(session_id = %id, error = %e, "failed to persist auth state");
                        }
                    });
                }
                WaEvent::Open { phone_number } => {
                    self.registry
                        .set_status(
                            &session_id,
                            SessionStatus::Connected,
                            Some(phone_number.clone()),
                        )
                        .await;
                    if let Err(e) = self
                        .store
                        .update_session_status(
                            &session_id,
                            SessionStatus::Connected,
                            Some(&phone_number),
                            None,
                        )
                        .await
                    {
                        warn!(session_id = %session_id, error = %e, "failed to persist connected status");
                    }
                    if let Err(e) = self.store.reset_reconnect_attempts(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "failed to reset reconnect counter");
                    }
                    self.meter.record_session_active(org_id).await;
                    info!(session_id = %session_id, phone_number = %phone_number, "session connected");
                    self.bus.publish(SessionEvent::ConnectionStatus {
                        session_id: session_id.clone(),
                        status: SessionStatus::Connected,
                        phone_number: Some(phone_number),
                    });
                }
                WaEvent::Close { reason } => {
                    self.handle_close(&session_id, reason).await;
                    return;
                }
                WaEvent::Messages { kind, messages } => {
                    // History syncs are not forwarded
                    if kind != MessageBatchKind::Notify {
                        continue;
                    }
                    for message in messages {
                        self.handle_inbound(&session_id, org_id, message).await;
                    }
                }
                WaEvent::GroupUpdate(meta) => {
                    let group = group_record(&session_id, &meta);
                    if let Err(e) = self.store.upsert_group(&group).await {
                        warn!(session_id = %session_id, group_jid = %meta.group_jid, error = %e, "group upsert failed");
                    }
                    self.bus.publish(SessionEvent::GroupUpdate {
                        session_id: session_id.clone(),
                        group,
                    });
                }
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, session_id: &str, reason: DisconnectReason) {
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Disconnected, None, None)
            .await
        {
            warn!(session_id, error = %e, "failed to persist disconnect");
        }
        self.bus.publish(SessionEvent::ConnectionStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Disconnected,
            phone_number: None,
        });

        match reason {
            DisconnectReason::LoggedOut => {
                // Credentials are dead; no reconnection
                info!(session_id, "session logged out");
                self.registry.deregister(session_id).await;
            }
            reason => {
                let rate_limited = reason == DisconnectReason::RateLimited;
                info!(session_id, ?reason, "session disconnected, scheduling reconnect");
                self.registry
                    .set_status(session_id, SessionStatus::Disconnected, None)
                    .await;
                self.reconnect
                    .handle_disconnect(self.clone(), session_id, rate_limited)
                    .await;
            }
        }
    }

    async fn handle_inbound(&self, session_id: &str, org_id: Uuid, message: InboundMessage) {
        let mut input = MessageInput {
            session_id: session_id.to_string(),
            org_id,
            message_id: message.message_id.clone(),
            direction: MessageDirection::Inbound,
            from_number: normalize_phone(&message.from_jid),
            to_number: normalize_phone(&message.to_jid),
            message_type: "text".to_string(),
            content: serde_json::json!({ "text": message.text }),
            status: MessageStatus::Delivered,
            is_group_message: false,
            group_jid: None,
            timestamp: message.timestamp,
        };
        if let Some(group_jid) = &message.group_jid {
            input.is_group_message = true;
            input.group_jid = Some(group_jid.clone());
        }

        let saved = match self.store.save_message(input).await {
            Ok(saved) => saved,
            Err(GatewayError::Validation(_)) => {
                debug!(session_id, message_id = %message.message_id, "duplicate inbound message ignored");
                return;
            }
            Err(e) => {
                error!(session_id, message_id = %message.message_id, error = %e, "failed to persist inbound message");
                return;
            }
        };

        if let Err(e) = self
            .meter
            .record_message(org_id, MessageDirection::Inbound)
            .await
        {
            warn!(session_id, error = %e, "failed to meter inbound message");
        }

        self.bus.publish(SessionEvent::Message {
            session_id: session_id.to_string(),
            message: saved.clone(),
        });
        self.sink.deliver(saved).await;
    }
}
