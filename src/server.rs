use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn, Instrument};

use crate::memory::{ConversationStore, SeenEvents};
use crate::platform::slack::{classify, EventPayload};
use crate::platform::InboundEvent;
use crate::relay::Relay;
use crate::signature::{SignatureVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};

const RETRY_HEADER: &str = "X-Slack-Retry-Num";

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<SignatureVerifier>,
    pub relay: Arc<Relay>,
    pub conversations: Arc<dyn ConversationStore>,
    pub seen_events: Arc<SeenEvents>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/slack/events", post(slack_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let conversations = match state.conversations.len().await {
        Ok(n) => n,
        Err(e) => {
            warn!("Failed to count conversations: {:#}", e);
            0
        }
    };
    Json(json!({ "status": "ok", "conversations": conversations }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify, acknowledge, and hand the event to the relay in the background.
async fn slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = state.verifier.verify(
        &body,
        header(&headers, TIMESTAMP_HEADER),
        header(&headers, SIGNATURE_HEADER),
    ) {
        warn!("Rejected request: {}", e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: EventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Unparseable event body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let (event, event_id) = match payload {
        EventPayload::UrlVerification { challenge } => {
            info!("Answering URL verification challenge");
            return Json(json!({ "challenge": challenge })).into_response();
        }
        EventPayload::EventCallback { event, event_id } => (event, event_id),
        EventPayload::Other => {
            debug!("Ignoring non-event payload");
            return StatusCode::OK.into_response();
        }
    };

    // Redeliveries of events never received before are handled normally
    if let Some(id) = event_id.as_deref() {
        if !state.seen_events.first_sighting(id).await {
            info!(
                "Skipping duplicate event {} (retry {})",
                id,
                header(&headers, RETRY_HEADER).unwrap_or("-")
            );
            return StatusCode::OK.into_response();
        }
    }

    let event = classify(event, state.relay.bot_user_id());
    if let InboundEvent::Unsupported(reason) = &event {
        debug!("Acknowledging unsupported event {:?}: {:?}", event_id, reason);
        return StatusCode::OK.into_response();
    }

    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("relay", %request_id, event_id = event_id.as_deref().unwrap_or("-"));
    let relay = state.relay.clone();
    tokio::spawn(
        async move {
            if let Err(e) = relay.handle(event).await {
                error!("Relay failed: {:#}", e);
            }
        }
        .instrument(span),
    );

    StatusCode::OK.into_response()
}
