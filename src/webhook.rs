//! Push-delivery surface: the provider POSTs a finished job's full result
//! payload to a caller-supplied URL instead of being polled.
//!
//! Deliveries are matched to pending jobs by `job_id`, falling back to the
//! correlation tokens embedded in the payload. Authentication uses an
//! optional shared-secret header.

use crate::errors::EngineError;
use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct PendingJob {
    sender: oneshot::Sender<Value>,
    tokens: HashSet<String>,
}

/// Routes webhook payloads to the job awaiting them. A delivery may arrive
/// at any time after submission, including the window between the submit
/// response and the job's registration; such early payloads are buffered
/// and replayed when the registration lands.
#[derive(Default)]
pub struct DeliveryRegistry {
    pending: Mutex<HashMap<String, PendingJob>>,
    early: Mutex<Vec<Value>>,
}

/// Cap on buffered early deliveries; beyond this the oldest are discarded.
const EARLY_BUFFER_CAP: usize = 64;

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a job before awaiting its delivery. `tokens`
    /// are the chunk's correlation tokens, used as a fallback match when a
    /// payload arrives without a job id. A payload that already arrived is
    /// consumed immediately.
    pub fn register(&self, job_id: &str, tokens: Vec<String>) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let token_set: HashSet<String> = tokens.into_iter().collect();

        if let Some(payload) = self.take_early(job_id, &token_set) {
            tracing::info!("Replaying early delivery for job {}", job_id);
            let _ = tx.send(payload);
            return rx;
        }

        let mut pending = self.pending.lock().expect("delivery registry poisoned");
        pending.insert(
            job_id.to_string(),
            PendingJob {
                sender: tx,
                tokens: token_set,
            },
        );
        rx
    }

    fn take_early(&self, job_id: &str, tokens: &HashSet<String>) -> Option<Value> {
        let mut early = self.early.lock().expect("delivery registry poisoned");
        let position = early.iter().position(|payload| {
            let by_id = payload
                .get("job_id")
                .or_else(|| payload.get("jobId"))
                .and_then(Value::as_str)
                == Some(job_id);
            let by_token = payload
                .get("results")
                .and_then(Value::as_array)
                .map_or(false, |records| {
                    records
                        .iter()
                        .filter_map(|r| r.get("token").and_then(Value::as_str))
                        .any(|t| tokens.contains(t))
                });
            by_id || by_token
        })?;
        Some(early.remove(position))
    }

    /// Hand a payload to its pending job. Returns false when no pending
    /// job matches (late or duplicate delivery).
    pub fn deliver(&self, payload: Value) -> bool {
        let mut pending = self.pending.lock().expect("delivery registry poisoned");

        let job_id = payload
            .get("job_id")
            .or_else(|| payload.get("jobId"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| match_by_tokens(&pending, &payload));

        let Some(job_id) = job_id else {
            tracing::warn!("Webhook delivery matched no pending job, buffering");
            drop(pending);
            self.buffer_early(payload);
            return false;
        };

        match pending.remove(&job_id) {
            Some(job) => {
                if job.sender.send(payload).is_err() {
                    tracing::warn!("Job {} receiver dropped before delivery", job_id);
                    return false;
                }
                tracing::info!("Delivered webhook payload for job {}", job_id);
                true
            }
            None => {
                tracing::warn!("Delivery for job {} arrived before registration, buffering", job_id);
                drop(pending);
                self.buffer_early(payload);
                false
            }
        }
    }

    fn buffer_early(&self, payload: Value) {
        let mut early = self.early.lock().expect("delivery registry poisoned");
        if early.len() >= EARLY_BUFFER_CAP {
            early.remove(0);
        }
        early.push(payload);
    }

    /// Drop a registration that will never be served (job failed at
    /// submission).
    pub fn forget(&self, job_id: &str) {
        self.pending
            .lock()
            .expect("delivery registry poisoned")
            .remove(job_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("delivery registry poisoned").len()
    }
}

fn match_by_tokens(pending: &HashMap<String, PendingJob>, payload: &Value) -> Option<String> {
    let records = payload.get("results")?.as_array()?;
    let payload_tokens: HashSet<&str> = records
        .iter()
        .filter_map(|r| r.get("token").and_then(Value::as_str))
        .collect();
    if payload_tokens.is_empty() {
        return None;
    }

    pending
        .iter()
        .find(|(_, job)| payload_tokens.iter().any(|t| job.tokens.contains(*t)))
        .map(|(id, _)| id.clone())
}

#[derive(Clone)]
pub struct WebhookState {
    pub registry: Arc<DeliveryRegistry>,
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeliveryAck {
    pub accepted: bool,
}

/// Build the webhook receiver router. Mount wherever the caller's HTTP
/// server lives; the engine only needs the shared registry.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/deliveries", post(receive_delivery))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Provider delivery endpoint.
///
/// Validates the shared secret when one is configured, then routes the
/// payload to the pending job. Unmatched deliveries are acknowledged with
/// `accepted: false` rather than erroring; the provider should not retry
/// a payload we can no longer use.
async fn receive_delivery(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<DeliveryAck>, EngineError> {
    if let Some(expected) = &state.secret {
        let presented = headers
            .get("X-Webhook-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != expected {
            return Err(EngineError::Permission(
                "webhook delivery with missing or wrong secret".to_string(),
            ));
        }
    }

    let accepted = state.registry.deliver(payload);
    Ok(Json(DeliveryAck { accepted }))
}
