//! # Delivery Gate
//!
//! Decides what to do with one webhook delivery. A fixed, ordered chain of
//! checks runs first and stops at the first rejection:
//!
//! 1. the HTTP method
//! 2. the hook id, when one is configured
//! 3. the event type header
//! 4. the payload signature
//!
//! Only a delivery that passes every check is decoded. The decoded event's
//! action then selects a [`GateDecision`]. The event payload is required only
//! for a qualifying action.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::event::{
    EVENT_HEADER, EventEnvelope, EventKind, InstallationEvent, ParseError, WorkflowJobEvent,
    decode_event,
};
use crate::secrets::{SecretError, SecretProvider};
use crate::webhook_verification::{SIGNATURE_HEADER, VerificationError, check_delivery_signature};

/// Header carrying the id of the webhook that produced a delivery.
pub const HOOK_ID_HEADER: &str = "X-Github-Hook-Id";

/// Header carrying the unique id of a delivery.
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

/// One inbound request. The body is captured once and used unchanged for
/// both signature verification and decoding.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookDelivery {
    pub fn new(method: Method, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            headers,
            body,
        }
    }

    /// A header value, if present and valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        self.header(EVENT_HEADER).and_then(EventKind::from_header)
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.header(DELIVERY_HEADER)
    }
}

/// Why a delivery was turned away. The `Display` text is returned to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("method {method} not allowed")]
    MethodNotAllowed { method: Method },
    #[error("missing X-Github-Hook-Id header")]
    MissingHookId,
    #[error("hook id mismatch")]
    HookIdMismatch,
    #[error("missing X-GitHub-Event header")]
    MissingEventType,
    #[error("unsupported event type")]
    UnsupportedEventType,
    /// The verification detail is logged, never returned.
    #[error("invalid signature")]
    InvalidSignature(VerificationError),
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("delivery rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("failed to read signature secret {name}: {source}")]
    Secret {
        name: String,
        #[source]
        source: SecretError,
    },
    #[error("failed to decode {kind} delivery: {source}")]
    Parse {
        kind: EventKind,
        #[source]
        source: ParseError,
    },
}

/// Outcome for a delivery that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// A queued workflow job: start one runner.
    Trigger(WorkflowJobEvent),
    /// A new app installation. Logged only.
    InstallationCreated(InstallationEvent),
    /// Authenticated traffic with a non-qualifying action.
    Ignored { kind: EventKind, action: String },
}

/// One step of the check chain.
#[async_trait]
pub trait DeliveryCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, delivery: &WebhookDelivery) -> Result<(), GateError>;
}

pub struct MethodCheck {
    pub allowed: Method,
}

#[async_trait]
impl DeliveryCheck for MethodCheck {
    fn name(&self) -> &'static str {
        "method"
    }

    async fn check(&self, delivery: &WebhookDelivery) -> Result<(), GateError> {
        if delivery.method != self.allowed {
            return Err(Rejection::MethodNotAllowed {
                method: delivery.method.clone(),
            }
            .into());
        }
        Ok(())
    }
}

pub struct HookIdCheck {
    pub expected: String,
}

#[async_trait]
impl DeliveryCheck for HookIdCheck {
    fn name(&self) -> &'static str {
        "hook_id"
    }

    async fn check(&self, delivery: &WebhookDelivery) -> Result<(), GateError> {
        match delivery.header(HOOK_ID_HEADER) {
            None => Err(Rejection::MissingHookId.into()),
            Some(value) if value != self.expected => Err(Rejection::HookIdMismatch.into()),
            Some(_) => Ok(()),
        }
    }
}

pub struct EventTypeCheck;

#[async_trait]
impl DeliveryCheck for EventTypeCheck {
    fn name(&self) -> &'static str {
        "event_type"
    }

    async fn check(&self, delivery: &WebhookDelivery) -> Result<(), GateError> {
        let Some(value) = delivery.header(EVENT_HEADER) else {
            return Err(Rejection::MissingEventType.into());
        };
        if EventKind::from_header(value).is_none() {
            info!(event = %value, "Unsupported event type");
            return Err(Rejection::UnsupportedEventType.into());
        }
        Ok(())
    }
}

/// Verifies `X-Hub-Signature-256`. The secret is read per delivery so a
/// rotated secret takes effect without a restart.
pub struct SignatureCheck {
    pub secret_name: Option<String>,
    pub secrets: Arc<dyn SecretProvider>,
}

#[async_trait]
impl DeliveryCheck for SignatureCheck {
    fn name(&self) -> &'static str {
        "signature"
    }

    async fn check(&self, delivery: &WebhookDelivery) -> Result<(), GateError> {
        let secret = match &self.secret_name {
            Some(name) => Some(self.secrets.read_secret(name).await.map_err(|source| {
                GateError::Secret {
                    name: name.clone(),
                    source,
                }
            })?),
            None => None,
        };

        check_delivery_signature(
            &delivery.body,
            delivery.header(SIGNATURE_HEADER),
            secret.as_ref().map(|bytes| bytes.as_slice()),
        )
        .map_err(Rejection::InvalidSignature)?;
        Ok(())
    }
}

pub struct DeliveryGate {
    checks: Vec<Box<dyn DeliveryCheck>>,
}

impl DeliveryGate {
    pub fn new(checks: Vec<Box<dyn DeliveryCheck>>) -> Self {
        Self { checks }
    }

    /// The webhook chain for `config`: method, hook id, event type, signature.
    pub fn for_webhooks(config: &AppConfig, secrets: Arc<dyn SecretProvider>) -> Self {
        let mut checks: Vec<Box<dyn DeliveryCheck>> = vec![Box::new(MethodCheck {
            allowed: Method::POST,
        })];
        if let Some(expected) = &config.hook_id {
            checks.push(Box::new(HookIdCheck {
                expected: expected.clone(),
            }));
        }
        checks.push(Box::new(EventTypeCheck));
        checks.push(Box::new(SignatureCheck {
            secret_name: config.github_signature_secret.clone(),
            secrets,
        }));
        Self::new(checks)
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    /// Runs the check chain, then decodes and classifies the delivery.
    pub async fn evaluate(&self, delivery: &WebhookDelivery) -> Result<GateDecision, GateError> {
        for check in &self.checks {
            check.check(delivery).await?;
            debug!(check = check.name(), "Delivery check passed");
        }

        let kind = delivery
            .event_kind()
            .ok_or(GateError::Rejected(Rejection::UnsupportedEventType))?;
        decode_event(kind, &delivery.body)
            .and_then(classify)
            .map_err(|source| GateError::Parse { kind, source })
    }
}

fn classify(envelope: EventEnvelope) -> Result<GateDecision, ParseError> {
    let kind = envelope.kind();
    if envelope.action() != kind.qualifying_action() {
        return Ok(GateDecision::Ignored {
            kind,
            action: envelope.action().to_string(),
        });
    }
    match kind {
        EventKind::WorkflowJob => envelope.into_workflow_job().map(GateDecision::Trigger),
        EventKind::Installation => envelope
            .into_installation()
            .map(GateDecision::InstallationCreated),
    }
}
