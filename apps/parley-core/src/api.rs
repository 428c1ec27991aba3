use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;

use crate::app::SharedState;
use crate::session::{Outbound, SessionCoordinator, SessionParams, SessionState, CLOSE_NORMAL};

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ApiError {
    message: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiError { message: message.into() })).into_response()
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api/sessions", get(list_sessions))
        .route("/api/ws/ticket", post(issue_ticket))
        .route("/ws/voice", get(voice_upgrade))
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    parley_telemetry::inc_api_request("/health");
    Json(Health { status: "ok", version: state.version })
}

async fn ready(State(state): State<SharedState>) -> impl IntoResponse {
    parley_telemetry::inc_api_request("/ready");
    if state.handles.memory.is_some() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE }
}

async fn metrics() -> impl IntoResponse {
    parley_telemetry::inc_api_request("/metrics");
    let body = parley_telemetry::gather_prometheus();
    ([("Content-Type", "text/plain; version=0.0.4")], body)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    id: String,
    character_id: i64,
    owner_id: i64,
    state: SessionState,
}

async fn list_sessions(State(state): State<SharedState>) -> impl IntoResponse {
    parley_telemetry::inc_api_request("/api/sessions");
    let registry = &state.handles.registry;
    let sessions: Vec<SessionInfo> = registry
        .ids()
        .into_iter()
        .filter_map(|id| registry.get(&id))
        .map(|h| SessionInfo { id: h.id().to_string(), character_id: h.character_id(), owner_id: h.owner_id(), state: h.state() })
        .collect();
    Json(sessions)
}

fn member_id(headers: &HeaderMap) -> Option<i64> {
    headers.get("x-member-id")?.to_str().ok()?.trim().parse().ok()
}

async fn issue_ticket(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    parley_telemetry::inc_api_request("/api/ws/ticket");
    let Some(member) = member_id(&headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "missing or invalid x-member-id");
    };
    let ticket = state.handles.tickets.issue(member);
    let ttl = state.config.read().auth().ticket_ttl_secs;
    Json(serde_json::json!({"ticket": ticket, "expiresIn": ttl})).into_response()
}

async fn voice_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    parley_telemetry::inc_api_request("/ws/voice");
    let params = match handshake(&state, &query) {
        Ok(p) => p,
        Err((status, message)) => {
            tracing::info!(%status, %message, "voice handshake rejected");
            return api_error(status, message);
        }
    };
    let limit = state.config.read().session().max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| run_voice(socket, state, params))
}

/// Validates the query before the upgrade; no session exists until this passes.
fn handshake(state: &SharedState, query: &HashMap<String, String>) -> Result<SessionParams, (StatusCode, String)> {
    let character_id: i64 = query
        .get("characterId")
        .ok_or((StatusCode::BAD_REQUEST, "characterId is required".to_string()))?
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "characterId must be an integer".to_string()))?;

    let cfg = state.config.read();
    let character = cfg
        .character(character_id)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown character {character_id}")))?;

    let auth = cfg.auth();
    let redeemed = query.get("ticket").and_then(|t| state.handles.tickets.redeem(t));
    let owner_id = match (redeemed, auth.require_ticket) {
        (Some(member), _) => member,
        (None, true) => return Err((StatusCode::UNAUTHORIZED, "invalid or expired ticket".to_string())),
        (None, false) => auth
            .default_member_id
            .ok_or((StatusCode::UNAUTHORIZED, "no ticket and no default member".to_string()))?,
    };

    Ok(SessionParams {
        character_id,
        owner_id,
        voice_id: character.voice_id.clone(),
        persona: character.persona.clone(),
    })
}

async fn run_voice(socket: WebSocket, state: SharedState, params: SessionParams) {
    let services = state.relay_services();
    let (coordinator, mut outbound) = SessionCoordinator::start(&services, params);
    let (mut sink, mut stream) = socket.split();

    let handle = coordinator.handle().clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound.next().await {
            let msg = match out {
                Outbound::Text(t) => Message::Text(t),
                Outbound::Audio(b) => Message::Binary(b),
                Outbound::Close { code, reason } => {
                    let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                handle.close(CLOSE_NORMAL, "client gone");
                break;
            }
        }
    });

    let cancel = coordinator.handle().cancel_token();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = stream.next() => m,
        };
        match msg {
            Some(Ok(Message::Binary(frame))) => coordinator.on_client_audio(frame),
            Some(Ok(Message::Text(text))) => coordinator.on_client_text(&text).await,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "client socket error");
                break;
            }
        }
    }
    coordinator.shutdown("client disconnected").await;
    let _ = writer.await;
}
