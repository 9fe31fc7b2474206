//! # Webhook Handler
//!
//! Receives GitHub deliveries, runs them through the delivery gate and
//! triggers one job run per queued workflow job.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{Instrument, info, info_span};

use crate::error::{ApiError, trace_headers};
use crate::event::EVENT_HEADER;
use crate::gate::{GateDecision, GateError, WebhookDelivery};
use crate::server::AppState;
use crate::telemetry::{TraceContext, with_trace_context};

pub const TRIGGERED_BODY: &str = "Triggered";
pub const IGNORED_BODY: &str = "Ignored";
pub const ACCEPTED_BODY: &str = "Accepted";

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Rejected(rejection) => ApiError::client(rejection.to_string()),
            other => ApiError::Server(anyhow::Error::new(other)),
        }
    }
}

/// Entry point for `/`. The response is produced inside the delivery's trace
/// context so it can echo the trace id.
pub async fn handle_webhook(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = WebhookDelivery::new(method, headers, body);
    let context = TraceContext::from_delivery_id(delivery.delivery_id());
    let span = info_span!(
        "webhook",
        trace_id = %context.trace_id,
        event = delivery.header(EVENT_HEADER).unwrap_or_default(),
    );

    with_trace_context(
        context,
        async move {
            match process_delivery(&state, &delivery).await {
                Ok(body) => (StatusCode::OK, trace_headers(), body).into_response(),
                Err(err) => err.into_response(),
            }
        }
        .instrument(span),
    )
    .await
}

async fn process_delivery(
    state: &AppState,
    delivery: &WebhookDelivery,
) -> Result<&'static str, ApiError> {
    match state.gate.evaluate(delivery).await? {
        GateDecision::Trigger(event) => {
            state
                .orchestrator
                .trigger_run(&event)
                .await
                .context("failed to trigger job run")?;
            Ok(TRIGGERED_BODY)
        }
        GateDecision::InstallationCreated(event) => {
            info!(
                installation_id = event.installation.id,
                app_id = ?event.installation.app_id,
                account = ?event.installation.account.as_ref().map(|a| a.login.as_str()),
                "GitHub App installed"
            );
            Ok(ACCEPTED_BODY)
        }
        GateDecision::Ignored { kind, action } => {
            info!(event = %kind, action = %action, "Ignoring non-qualifying action");
            Ok(IGNORED_BODY)
        }
    }
}
