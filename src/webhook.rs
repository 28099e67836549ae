//! Inbound webhook surface for push-based status reports.
//!
//! The engine signs each delivery with HMAC-SHA256 over the raw body and
//! sends the hex digest in `X-Engine-Signature: sha256=<hex>`. Verification
//! fails closed: with no secret configured, deliveries are rejected unless
//! the dev bypass is explicitly enabled.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::fetcher::ResultsFetcher;
use crate::metrics::Metrics;
use crate::state_machine::{ReportedStatus, WebhookEvent};
use crate::store::{ApplicationStore, ReportSource, apply_report};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-engine-signature";

#[derive(Clone)]
pub struct WebhookState {
    pub store: Arc<dyn ApplicationStore>,
    pub fetcher: Arc<ResultsFetcher>,
    pub secret: Option<String>,
    pub allow_unverified: bool,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/engine", post(handle_engine_webhook))
        .with_state(state)
}

/// Wire body of an engine delivery.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    task_id: String,
    status: ReportedStatus,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error_details: Option<String>,
}

/// Verify an `X-Engine-Signature: sha256=<hex>` header against the raw body.
pub fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_sig) = hex::decode(hex_signature) else {
        return false;
    };
    // SHA-256 digests are 32 bytes; reject other lengths before comparing.
    if expected_sig.len() != 32 {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed_sig = mac.finalize().into_bytes();

    computed_sig.as_slice().ct_eq(expected_sig.as_slice()).into()
}

async fn handle_engine_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    Metrics::incr(&state.metrics.webhooks_received);

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let signature_valid = match &state.secret {
        Some(secret) => verify_signature(secret, signature, &body),
        None if state.allow_unverified => {
            tracing::warn!("accepting unverified webhook, no signing secret configured");
            true
        }
        None => false,
    };
    if !signature_valid {
        Metrics::incr(&state.metrics.webhooks_rejected);
        tracing::warn!("webhook rejected: signature verification failed");
        return StatusCode::FORBIDDEN;
    }

    let parsed: WebhookBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "webhook rejected: malformed body");
            return StatusCode::BAD_REQUEST;
        }
    };
    let event = WebhookEvent {
        external_task_id: parsed.task_id,
        reported_status: parsed.status,
        payload: parsed.data,
        error_details: parsed.error_details,
        received_at: Utc::now(),
        signature_valid,
    };

    match process_event(&state, event).await {
        Ok(()) => StatusCode::OK,
        Err(status) => status,
    }
}

async fn process_event(state: &WebhookState, event: WebhookEvent) -> Result<(), StatusCode> {
    let outcome = apply_report(
        &*state.store,
        &event.external_task_id,
        event.reported_status,
        event.payload.as_ref(),
        event.error_details.as_deref(),
        ReportSource::Webhook,
    )
    .await
    .map_err(|err| {
        if err.is_invariant_violation() {
            tracing::error!(
                external_task_id = event.external_task_id,
                error = %err,
                "webhook hit a data invariant violation"
            );
        } else {
            tracing::error!(
                external_task_id = event.external_task_id,
                error = %err,
                "webhook processing failed"
            );
        }
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let Some(outcome) = outcome else {
        // Accept-and-log: the engine should not retry deliveries for tasks
        // this instance never registered, but the gap is worth monitoring.
        Metrics::incr(&state.metrics.webhooks_unknown_task);
        tracing::warn!(
            external_task_id = event.external_task_id,
            "webhook for unknown task, acknowledged and dropped"
        );
        return Ok(());
    };

    tracing::info!(
        external_task_id = event.external_task_id,
        application_id = %outcome.application_id,
        status = %outcome.status,
        changed = outcome.changed,
        "webhook applied"
    );

    if outcome.fetch_results {
        let fetcher = state.fetcher.clone();
        let external_task_id = event.external_task_id.clone();
        tokio::spawn(async move {
            if let Err(err) = fetcher.fetch(&external_task_id).await {
                tracing::warn!(external_task_id, error = %err, "results fetch failed");
            }
        });
    }

    Ok(())
}
