use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use veritas_core::ServerConfig;

use crate::dispatch::{Dispatcher, Submission};
use crate::error::WebhookError;
use crate::events::PullRequestEvent;
use crate::signature::verify_signature;

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-github-event";
/// Header carrying the body's HMAC.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct AppState {
    dispatcher: Dispatcher,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, config: ServerConfig) -> Self {
        Self {
            dispatcher,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Accept a GitHub delivery.
///
/// `ping` answers pong, an eligible `pull_request` is dispatched with
/// `202 Accepted`, everything else is acknowledged and ignored.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    match state.config.webhook_secret.as_deref() {
        Some(secret) => verify_signature(
            secret.as_bytes(),
            &body,
            header(&headers, SIGNATURE_HEADER),
        )?,
        None => tracing::warn!("no webhook secret configured, accepting unsigned delivery"),
    }

    let event = header(&headers, EVENT_HEADER).ok_or(WebhookError::MissingEvent)?;
    tracing::debug!(event, bytes = body.len(), "webhook received");
    match event {
        "ping" => Ok(reply(StatusCode::OK, "pong")),
        "pull_request" => pull_request(&state, &body),
        other => Ok(reply(StatusCode::OK, &format!("ignored event {other}"))),
    }
}

fn pull_request(state: &AppState, body: &[u8]) -> Result<Response, WebhookError> {
    let event: PullRequestEvent =
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    let pr = event.pr_id();

    if !event.is_reviewable_action() {
        tracing::debug!(pr = %pr, action = %event.action, "ignoring pull request action");
        return Ok(reply(StatusCode::OK, &format!("ignored action {}", event.action)));
    }
    let branch = event.target_branch();
    if !state.config.is_monitored(&event.repository.full_name, branch) {
        tracing::info!(pr = %pr, branch, "repository or branch not monitored");
        return Ok(reply(StatusCode::OK, "not monitored"));
    }

    tracing::info!(pr = %pr, title = %event.pull_request.title, action = %event.action, "pull request event accepted");
    let msg = match state.dispatcher.submit(event.job()) {
        Submission::Started => "review started",
        Submission::Queued => "review queued",
    };
    Ok(reply(StatusCode::ACCEPTED, msg))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reply(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "msg": msg }))).into_response()
}
