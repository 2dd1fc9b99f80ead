//! Status and event API for the presentation layer
//!
//! - GET /health
//! - GET /requests, GET /requests/:chain_ref
//! - GET /group-key, GET /roster
//! - GET /events (WebSocket push of request state changes)
//! - POST /events/deposit, POST /events/burn (intake for external monitors)

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use xmr_bridge_core::bridge::{ExternalEvent, ParticipantNode};
use xmr_bridge_core::chain::{BurnEvent, DepositObservation};
use xmr_bridge_core::mpc::Transport;

/// Shared handler state
pub struct ApiState {
    pub node: Arc<ParticipantNode<dyn Transport>>,
    pub events: mpsc::Sender<ExternalEvent>,
}

pub type SharedState = Arc<ApiState>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/requests", get(list_requests))
        .route("/requests/:chain_ref", get(get_request))
        .route("/group-key", get(group_key))
        .route("/roster", get(roster))
        .route("/events", get(events_ws))
        .route("/events/deposit", post(post_deposit))
        .route("/events/burn", post(post_burn))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let halted = state.node.halted().map(str::to_string);
    let status = if halted.is_some() { "halted" } else { "ok" };
    Json(serde_json::json!({
        "status": status,
        "participant_id": state.node.participant_id(),
        "halted_reason": halted,
        "requests": state.node.requests().len(),
        "version": xmr_bridge_core::VERSION,
    }))
}

/// GET /requests
async fn list_requests(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.node.requests().list())
}

/// GET /requests/:chain_ref
async fn get_request(
    State(state): State<SharedState>,
    Path(chain_ref): Path<String>,
) -> impl IntoResponse {
    match state.node.requests().get(&chain_ref) {
        Some(request) => Json(request).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("no request for {}", chain_ref),
        )
        .into_response(),
    }
}

/// GET /group-key
async fn group_key(State(state): State<SharedState>) -> impl IntoResponse {
    let registry = state.node.registry();
    Json(serde_json::json!({
        "group_public_key": hex::encode(state.node.group_public_key()),
        "threshold": registry.threshold(),
        "total": registry.total(),
    }))
}

/// GET /roster
async fn roster(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.node.registry().roster().into_iter().cloned().collect::<Vec<_>>())
}

fn enqueue(state: &ApiState, event: ExternalEvent) -> (StatusCode, Json<serde_json::Value>) {
    match state.events.try_send(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "queued": true })),
        ),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("External event queue full");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "event queue full, retry later" })),
            )
        }
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "bridge service stopped" })),
        ),
    }
}

/// POST /events/deposit
async fn post_deposit(
    State(state): State<SharedState>,
    Json(observation): Json<DepositObservation>,
) -> impl IntoResponse {
    enqueue(&state, ExternalEvent::Deposit(observation))
}

/// POST /events/burn
async fn post_burn(
    State(state): State<SharedState>,
    Json(burn): Json<BurnEvent>,
) -> impl IntoResponse {
    enqueue(&state, ExternalEvent::Burn(burn))
}

/// GET /events
async fn events_ws(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.node.requests().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<xmr_bridge_core::request::RequestEvent>,
) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(_) => continue,
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
