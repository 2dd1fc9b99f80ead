//! Message Relay Service
//!
//! HTTP service that stores signed envelopes until their recipient polls
//! for them.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use msg_relay::{MessageStore, PartyId, RelayError, SignedEnvelope, StoredMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};

/// Largest batch returned by one poll
const MAX_FETCH: usize = 256;

/// Message relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "msg-relay-svc")]
#[command(about = "Message relay service for bridge participants")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "RELAY_LISTEN")]
    listen: String,

    /// Message TTL in seconds
    #[arg(long, default_value = "3600")]
    ttl: i64,

    /// Interval between expiry sweeps, in seconds
    #[arg(long, default_value = "60")]
    cleanup_interval: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Application state
struct AppState {
    store: MessageStore,
}

#[derive(Debug, Serialize, Deserialize)]
struct PostResponse {
    seq: u64,
    duplicate: bool,
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    #[serde(default)]
    after: u64,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FetchResponse {
    messages: Vec<StoredMessage>,
    head: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        listen = %args.listen,
        ttl = args.ttl,
        "Starting message relay service"
    );

    let state = Arc::new(AppState {
        store: MessageStore::new(args.ttl),
    });

    // Spawn cleanup task
    let cleanup_store = state.store.clone();
    let period = Duration::from_secs(args.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let removed = cleanup_store.cleanup();
            if removed > 0 {
                debug!(removed, "Expired messages dropped");
            }
        }
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/msg", post(post_message))
        .route("/v1/msg/:to", get(fetch_messages))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "msg-relay-svc",
        "version": env!("CARGO_PKG_VERSION"),
        "stored": state.store.len(),
    }))
}

/// Post a signed envelope to its recipient's mailbox
async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SignedEnvelope>,
) -> impl IntoResponse {
    let (from, to) = (envelope.from, envelope.to);
    match state.store.put(envelope) {
        Ok(receipt) => {
            debug!(from, to, seq = receipt.seq, duplicate = receipt.duplicate, "Message stored");
            (
                StatusCode::OK,
                Json(serde_json::json!(PostResponse {
                    seq: receipt.seq,
                    duplicate: receipt.duplicate,
                })),
            )
        }
        Err(e) => {
            warn!(from, to, error = %e, "Rejected message");
            let status = match &e {
                RelayError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

/// Messages for a recipient after a cursor
async fn fetch_messages(
    State(state): State<Arc<AppState>>,
    Path(to): Path<PartyId>,
    Query(query): Query<FetchQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(MAX_FETCH).min(MAX_FETCH);
    Json(FetchResponse {
        messages: state.store.fetch(to, query.after, limit),
        head: state.store.head(to),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ed25519_dalek::SigningKey;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(AppState {
            store: MessageStore::new(3600),
        }))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(envelope: &SignedEnvelope) -> Request<Body> {
        Request::post("/v1/msg")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(envelope).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_post_then_fetch() {
        let app = app();
        let key = SigningKey::from_bytes(&[1; 32]);
        let envelope = SignedEnvelope::seal(&key, 1, 2, b"share".to_vec());

        let response = app.clone().oneshot(post(&envelope)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["seq"], 1);

        let response = app.clone().oneshot(post(&envelope)).await.unwrap();
        assert_eq!(json_body(response).await["duplicate"], true);

        let response = app
            .clone()
            .oneshot(Request::get("/v1/msg/2?after=0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: FetchResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(body.head, 1);
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].envelope, envelope);

        let response = app
            .oneshot(Request::get("/v1/msg/2?after=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: FetchResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert!(body.messages.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_self_addressed() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let envelope = SignedEnvelope::seal(&key, 2, 2, vec![]);
        let response = app().oneshot(post(&envelope)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
