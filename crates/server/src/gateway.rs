use crate::context::AppContext;
use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use wabridge_core::bus::SessionEvent;
use wabridge_core::error::{GatewayError, LimitKind};
use wabridge_core::types::{Organization, Session};

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

pub struct Gateway {
    ctx: AppContext,
    port: u16,
}

impl Gateway {
    pub fn new(ctx: AppContext, port: u16) -> Self {
        Self { ctx, port }
    }

    pub fn router(ctx: AppContext) -> Router {
        Router::new()
            .route("/api/health", get(health))
            .route("/api/sessions/create", post(create_session))
            .route("/api/sessions", get(list_sessions))
            .route("/api/sessions/:id/status", get(session_status))
            .route("/api/sessions/:id/disconnect", post(disconnect_session))
            .route("/api/messages/:session_id/send", post(send_message))
            .route("/api/groups/:session_id/groups", get(list_groups))
            .route("/api/groups/:session_id/create", post(create_group))
            .route("/api/groups/:jid/add-participants", post(add_participants))
            .route("/api/groups/:jid/remove-participant", post(remove_participant))
            .route("/api/groups/:jid/promote", post(promote_participant))
            .route("/api/groups/:jid/demote", post(demote_participant))
            .route("/api/groups/:jid/broadcast", post(broadcast_group))
            .route("/api/groups/:jid/settings", post(group_settings))
            .route("/api/groups/:jid/participants", get(group_participants))
            .route("/api/usage", get(usage))
            .route("/ws", get(ws_events))
            .with_state(ctx)
    }

    pub async fn start(&self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", addr);
        axum::serve(listener, Self::router(self.ctx.clone()))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Map the error hierarchy onto the HTTP surface.
fn error_response(err: GatewayError) -> ApiError {
    match err {
        GatewayError::Validation(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))),
        GatewayError::Auth(msg) => (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg }))),
        GatewayError::LimitExceeded {
            kind,
            current,
            limit,
        } => {
            let code = match kind {
                LimitKind::Accounts => StatusCode::FORBIDDEN,
                LimitKind::Messages => StatusCode::TOO_MANY_REQUESTS,
            };
            (
                code,
                Json(json!({ "error": kind.as_str(), "current": current, "limit": limit })),
            )
        }
        GatewayError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("not found: {what}") })),
        ),
        GatewayError::NotConnected(id) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("session {id} is not connected") })),
        ),
        GatewayError::Transient(msg) | GatewayError::Fatal(msg) => {
            error!(error = %msg, "internal error on api edge");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

fn bad_request(msg: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

/// Resolve the bearer token to an organization. 401 on anything else.
async fn check_auth(ctx: &AppContext, headers: &HeaderMap) -> Result<Organization, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if token.is_empty() {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        ));
    }
    match ctx.store.find_org_by_token(token).await {
        Ok(Some(org)) => {
            ctx.meter.record_api_call(org.id).await;
            Ok(org)
        }
        Ok(None) => {
            warn!("rejected request with unknown bearer token");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid bearer token" })),
            ))
        }
        Err(e) => Err(error_response(e)),
    }
}

/// The session must exist and belong to the caller's org.
async fn owned_session(
    ctx: &AppContext,
    org: &Organization,
    session_id: &str,
) -> Result<Session, ApiError> {
    match ctx.store.get_session(session_id).await {
        Ok(Some(session)) if session.org_id == org.id => Ok(session),
        Ok(Some(_)) => Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "session belongs to another organization" })),
        )),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )),
        Err(e) => Err(error_response(e)),
    }
}

async fn health(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": ctx.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    session_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    user_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    sub_account_id: Option<String>,
}

async fn create_session(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let Some(session_id) = req.session_id.filter(|s| !s.is_empty()) else {
        return Err(bad_request("session_id is required"));
    };

    ctx.guard
        .check_account_limit(&org)
        .await
        .map_err(error_response)?;
    ctx.supervisor
        .create_session(&session_id, org.id)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({ "success": true, "session_id": session_id })))
}

fn session_json(session: &Session) -> Value {
    json!({
        "sessionId": session.session_id,
        "status": session.status,
        "phoneNumber": session.phone_number,
        "createdAt": session.created_at.to_rfc3339(),
    })
}

async fn list_sessions(State(ctx): State<AppContext>, headers: HeaderMap) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let sessions = ctx
        .store
        .list_sessions_for_org(org.id)
        .await
        .map_err(error_response)?;

    // A live handle is fresher than the persisted row while events are in
    // flight, so its status wins
    let live: HashMap<String, wabridge_session::HandleSnapshot> = ctx
        .supervisor
        .registry()
        .snapshots()
        .await
        .into_iter()
        .map(|snap| (snap.session_id.clone(), snap))
        .collect();

    let sessions: Vec<Value> = sessions
        .iter()
        .map(|session| match live.get(&session.session_id) {
            Some(handle) => json!({
                "sessionId": session.session_id,
                "status": handle.status,
                "phoneNumber": handle
                    .phone_number
                    .clone()
                    .or_else(|| session.phone_number.clone()),
                "createdAt": session.created_at.to_rfc3339(),
            }),
            None => session_json(session),
        })
        .collect();

    Ok(Json(json!({ "sessions": sessions })))
}

async fn session_status(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session = owned_session(&ctx, &org, &session_id).await?;
    Ok(Json(session_json(&session)))
}

async fn disconnect_session(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    owned_session(&ctx, &org, &session_id).await?;

    // Outbound worker first, then the live handle and its timers
    ctx.queue.remove_session(&session_id);
    ctx.supervisor
        .destroy_session(&session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    to: Option<String>,
    message: Option<String>,
    /// Emergency-only: skip the queue and the rate limiter.
    #[serde(default)]
    immediate: bool,
}

async fn send_message(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(to) = req.to.filter(|s| !s.is_empty()) else {
        return Err(bad_request("to is required"));
    };
    let Some(message) = req.message.filter(|s| !s.is_empty()) else {
        return Err(bad_request("message is required"));
    };

    ctx.guard
        .check_message_limit(&org, 1)
        .await
        .map_err(error_response)?;

    if req.immediate {
        let sent = ctx
            .queue
            .send_immediate(&session_id, &to, &message)
            .await
            .map_err(error_response)?;
        return Ok(Json(json!({ "success": true, "message_id": sent.id })));
    }

    let queue_id = ctx
        .queue
        .enqueue(&session_id, &to, &message, "text")
        .map_err(error_response)?;

    Ok(Json(json!({ "success": true, "queue_id": queue_id })))
}

fn group_json(meta: &wabridge_wa::GroupMetadata) -> Value {
    json!({
        "groupJid": meta.group_jid,
        "name": meta.subject,
        "description": meta.description,
        "participantCount": meta.participants.len(),
        "isAdmin": meta.we_are_admin,
    })
}

async fn list_groups(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    owned_session(&ctx, &org, &session_id).await?;
    let groups = ctx
        .supervisor
        .list_groups(&session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "groups": groups.iter().map(group_json).collect::<Vec<_>>()
    })))
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    subject: Option<String>,
    #[serde(default)]
    participants: Vec<String>,
}

async fn create_group(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(subject) = req.subject.filter(|s| !s.is_empty()) else {
        return Err(bad_request("subject is required"));
    };
    if req.participants.is_empty() {
        return Err(bad_request("participants are required"));
    }

    let meta = ctx
        .supervisor
        .create_group(&session_id, &subject, &req.participants)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "group": group_json(&meta) })))
}

#[derive(Deserialize)]
struct GroupMembersRequest {
    session_id: Option<String>,
    #[serde(default)]
    participants: Vec<String>,
    participant: Option<String>,
}

fn require_session_id(session_id: Option<String>) -> Result<String, ApiError> {
    session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("session_id is required"))
}

async fn add_participants(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<GroupMembersRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    if req.participants.is_empty() {
        return Err(bad_request("participants are required"));
    }
    ctx.supervisor
        .add_participants(&session_id, &jid, &req.participants)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn remove_participant(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<GroupMembersRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(participant) = req.participant.filter(|s| !s.is_empty()) else {
        return Err(bad_request("participant is required"));
    };
    ctx.supervisor
        .remove_participant(&session_id, &jid, &participant)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn promote_participant(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<GroupMembersRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(participant) = req.participant.filter(|s| !s.is_empty()) else {
        return Err(bad_request("participant is required"));
    };
    ctx.supervisor
        .promote_participant(&session_id, &jid, &participant)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

async fn demote_participant(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<GroupMembersRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(participant) = req.participant.filter(|s| !s.is_empty()) else {
        return Err(bad_request("participant is required"));
    };
    ctx.supervisor
        .demote_participant(&session_id, &jid, &participant)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct BroadcastRequest {
    session_id: Option<String>,
    message: Option<String>,
}

async fn broadcast_group(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<BroadcastRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(message) = req.message.filter(|s| !s.is_empty()) else {
        return Err(bad_request("message is required"));
    };

    let delivered = ctx
        .supervisor
        .broadcast_to_group(&session_id, &jid, &message)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "delivered": delivered })))
}

#[derive(Deserialize)]
struct GroupSettingsRequest {
    session_id: Option<String>,
    announce_only: Option<bool>,
}

async fn group_settings(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Json(req): Json<GroupSettingsRequest>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(req.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let Some(announce_only) = req.announce_only else {
        return Err(bad_request("announce_only is required"));
    };
    ctx.supervisor
        .update_group_settings(&session_id, &jid, announce_only)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct ParticipantsQuery {
    session_id: Option<String>,
}

async fn group_participants(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(jid): Path<String>,
    Query(query): Query<ParticipantsQuery>,
) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let session_id = require_session_id(query.session_id)?;
    owned_session(&ctx, &org, &session_id).await?;
    let meta = ctx
        .supervisor
        .group_metadata(&session_id, &jid)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "participants": meta
            .participants
            .iter()
            .map(|p| json!({ "jid": p.jid, "isAdmin": p.is_admin }))
            .collect::<Vec<_>>()
    })))
}

async fn usage(State(ctx): State<AppContext>, headers: HeaderMap) -> ApiResult {
    let org = check_auth(&ctx, &headers).await?;
    let usage = ctx
        .meter
        .current_month(org.id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "messagesSent": usage.messages_sent,
        "messagesReceived": usage.messages_received,
        "activeSessions": usage.active_sessions,
        "apiCalls": usage.api_calls,
    })))
}

/// Map a bus event to its WebSocket frame for subscribers of that session's
/// room. Returns the room key and the frame payload.
fn event_to_frame(event: &SessionEvent) -> (String, Value) {
    let frame = match event {
        SessionEvent::Qr { qr, .. } => json!({ "type": "qr_updated", "qr": qr }),
        SessionEvent::ConnectionStatus {
            status,
            phone_number,
            ..
        } => json!({
            "type": "connection_status",
            "status": status,
            "phoneNumber": phone_number,
        }),
        SessionEvent::Message { message, .. } => json!({
            "type": "new_message",
            "from": message.from_number,
            "message": message.content.get("text").and_then(|t| t.as_str()).unwrap_or_default(),
            "timestamp": message.timestamp.to_rfc3339(),
        }),
        SessionEvent::GroupUpdate { group, .. } => json!({
            "type": "group_update",
            "groupJid": group.group_jid,
            "name": group.name,
            "participantCount": group.participant_count,
        }),
    };
    (event.session_id().to_string(), frame)
}

#[derive(Deserialize)]
struct WsCommand {
    #[serde(rename = "type")]
    kind: String,
    session_id: Option<String>,
}

async fn ws_events(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let org = check_auth(&ctx, &headers).await?;
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, ctx, org)))
}

async fn handle_ws(mut socket: WebSocket, ctx: AppContext, org: Organization) {
    let mut events = ctx.bus.subscribe();
    let mut joined: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) else {
                            continue;
                        };
                        if cmd.kind != "join_session" {
                            continue;
                        }
                        let Some(session_id) = cmd.session_id else { continue };
                        // Rooms are org-scoped: you can only join your own
                        match ctx.store.get_session(&session_id).await {
                            Ok(Some(session)) if session.org_id == org.id => {
                                joined.insert(session_id.clone());
                                let ack = json!({ "type": "joined", "session_id": session_id });
                                if socket.send(WsMessage::Text(ack.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            _ => {
                                let err = json!({ "type": "error", "error": "unknown session" });
                                if socket.send(WsMessage::Text(err.to_string())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let (session_id, frame) = event_to_frame(&event);
                        if !joined.contains(&session_id) {
                            continue;
                        }
                        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged behind the bus");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    }
}
