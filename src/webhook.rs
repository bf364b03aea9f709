//! HTTP push endpoint for Pub/Sub push subscriptions.
//!
//! - `POST /webhook/pubsub`: decode the push envelope and triage the cursor
//! - `GET /health`: liveness plus classifier circuit state

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::listener::payload::{PushEnvelope, decode_envelope};
use crate::pipeline::dispatcher::TriageDispatcher;

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub dispatcher: Arc<TriageDispatcher>,
}

fn bad_request(detail: String) -> axum::response::Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": detail }))).into_response()
}

/// POST /webhook/pubsub
///
/// 202 with the batch outcome, 400 for payloads that can never succeed,
/// 500 when triage failed and the push should be retried.
async fn pubsub_push(State(state): State<WebhookState>, body: Bytes) -> impl IntoResponse {
    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Rejected push: body is not a JSON envelope");
            return bad_request(format!("Invalid push body: {e}"));
        }
    };

    let event = match decode_envelope(&envelope) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Rejected malformed push notification");
            return bad_request(e.to_string());
        }
    };

    info!(
        email_address = %event.email_address,
        history_id = %event.history_id,
        "Received push notification"
    );

    match state.dispatcher.on_history(&event.history_id).await {
        Ok(report) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "success",
                "history_id": report.history_id,
                "processed_emails": report.processed,
                "failed_emails": report.failed.len(),
            })),
        )
            .into_response(),
        Err(e) => {
            error!(history_id = %event.history_id, error = %e, "Push notification triage failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<WebhookState>) -> impl IntoResponse {
    let breaker = format!("{:?}", state.dispatcher.classifier().breaker_state()).to_lowercase();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "classifier_circuit": breaker,
    }))
}

/// Build the webhook routes.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/pubsub", post(pubsub_push))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
