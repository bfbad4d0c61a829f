//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use deployit_core::pipeline::{TriggerInfo, TriggerKind};
use deployit_core::source::Revision;
use deployit_scheduler::{Submitted, TriggerRequest};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// The parts of a GitHub push payload a trigger needs.
#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: PushRepository,
    pusher: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct Pusher {
    name: String,
}

impl PushEvent {
    fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }
}

#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    pub event: String,
    pub triggered: Vec<TriggeredPipeline>,
}

#[derive(Debug, Serialize)]
pub struct TriggeredPipeline {
    pub pipeline: String,
    pub revision: String,
    /// A pending request for the pipeline was replaced by this one.
    pub replaced: bool,
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let delivery = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, delivery = %delivery, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".into()));
        }
    }

    info!(event = %event_type, delivery = %delivery, "Received GitHub webhook");

    let mut response = WebhookResponse {
        event: event_type.clone(),
        ..Default::default()
    };

    match event_type.as_str() {
        "push" => {
            let push: PushEvent = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("Invalid push payload: {}", e)))?;
            response.triggered = handle_push_event(&state, push).await;
        }
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
        }
        _ => {
            info!(event = %event_type, "Unhandled event type");
        }
    }

    let status = if response.triggered.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(response)))
}

/// Queue a run for every pipeline watching the pushed branch.
async fn handle_push_event(state: &AppState, push: PushEvent) -> Vec<TriggeredPipeline> {
    let Some(branch) = push.branch() else {
        info!(git_ref = %push.git_ref, "Push is not to a branch, ignoring");
        return Vec::new();
    };
    if push.deleted {
        info!(repo = %push.repository.full_name, branch = %branch, "Branch deleted, ignoring");
        return Vec::new();
    }

    let revision = Revision::new(push.after.clone());
    let mut triggered = Vec::new();
    for pipeline in state.pipelines_watching(&push.repository.full_name, branch) {
        let mut trigger = TriggerInfo::at(TriggerKind::Push, revision.clone());
        trigger.actor = push.pusher.as_ref().map(|p| p.name.clone());

        let submitted = state
            .queue
            .submit(TriggerRequest::new(pipeline.name(), trigger))
            .await;
        info!(
            pipeline = %pipeline.name(),
            revision = %revision.short(),
            "Push queued a run"
        );
        triggered.push(TriggeredPipeline {
            pipeline: pipeline.name().to_string(),
            revision: revision.to_string(),
            replaced: matches!(submitted, Submitted::Replaced { .. }),
        });
    }

    if triggered.is_empty() {
        info!(
            repo = %push.repository.full_name,
            branch = %branch,
            "No pipelines watch this branch"
        );
    }
    triggered
}

/// Verify a GitHub `sha256=<hex>` webhook signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
