//! # Event Envelope
//!
//! Typed view of a GitHub webhook body. The `X-GitHub-Event` header picks the
//! variant; only the fields used for gating and job parameterization are
//! strongly typed, the rest of the body is kept as an opaque passthrough.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Header naming the event type of a delivery.
pub const EVENT_HEADER: &str = "X-GitHub-Event";

pub const ACTION_QUEUED: &str = "queued";
pub const ACTION_IN_PROGRESS: &str = "in_progress";
pub const ACTION_COMPLETED: &str = "completed";
pub const ACTION_WAITING: &str = "waiting";
pub const ACTION_CREATED: &str = "created";

/// Event types this service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkflowJob,
    Installation,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::WorkflowJob, EventKind::Installation];

    /// Maps an `X-GitHub-Event` header value to a supported kind.
    pub fn from_header(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowJob => "workflow_job",
            EventKind::Installation => "installation",
        }
    }

    /// The single action value this service reacts to for the kind.
    pub fn qualifying_action(&self) -> &'static str {
        match self {
            EventKind::WorkflowJob => ACTION_QUEUED,
            EventKind::Installation => ACTION_CREATED,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding a delivery body.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed event body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{event} event is missing its '{field}' payload")]
    MissingPayload {
        event: EventKind,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The `workflow_job` record of a workflow job event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub run_attempt: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub head_sha: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub run_url: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_id: Option<u64>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub runner_group_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// The `installation` record of a GitHub App installation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: u64,
    #[serde(default)]
    pub app_id: Option<u64>,
    #[serde(default)]
    pub account: Option<Actor>,
    #[serde(default)]
    pub target_type: Option<String>,
}

/// Fields shared by every event type.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub action: String,
    pub sender: Option<Actor>,
    pub repository: Option<Repository>,
    pub organization: Option<Organization>,
    /// Every top-level field without a typed home above.
    pub extra: Map<String, Value>,
}

/// A workflow job event whose `workflow_job` record is present.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowJobEvent {
    pub context: EventContext,
    pub workflow_job: WorkflowJob,
}

/// An installation event whose `installation` record is present.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationEvent {
    pub context: EventContext,
    pub installation: Installation,
}

/// A decoded delivery, tagged by the event header. The kind's payload may be
/// absent; [`EventEnvelope::into_workflow_job`] and
/// [`EventEnvelope::into_installation`] require it.
#[derive(Debug, Clone, PartialEq)]
pub enum EventEnvelope {
    WorkflowJob {
        context: EventContext,
        workflow_job: Option<WorkflowJob>,
    },
    Installation {
        context: EventContext,
        installation: Option<Installation>,
    },
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        match self {
            EventEnvelope::WorkflowJob { .. } => EventKind::WorkflowJob,
            EventEnvelope::Installation { .. } => EventKind::Installation,
        }
    }

    pub fn context(&self) -> &EventContext {
        match self {
            EventEnvelope::WorkflowJob { context, .. } => context,
            EventEnvelope::Installation { context, .. } => context,
        }
    }

    pub fn action(&self) -> &str {
        &self.context().action
    }

    /// Whether the payload subtree for this kind was present in the body.
    pub fn has_payload(&self) -> bool {
        match self {
            EventEnvelope::WorkflowJob { workflow_job, .. } => workflow_job.is_some(),
            EventEnvelope::Installation { installation, .. } => installation.is_some(),
        }
    }

    pub fn into_workflow_job(self) -> Result<WorkflowJobEvent, ParseError> {
        match self {
            EventEnvelope::WorkflowJob {
                context,
                workflow_job: Some(workflow_job),
            } => Ok(WorkflowJobEvent {
                context,
                workflow_job,
            }),
            other => Err(ParseError::MissingPayload {
                event: other.kind(),
                field: "workflow_job",
            }),
        }
    }

    pub fn into_installation(self) -> Result<InstallationEvent, ParseError> {
        match self {
            EventEnvelope::Installation {
                context,
                installation: Some(installation),
            } => Ok(InstallationEvent {
                context,
                installation,
            }),
            other => Err(ParseError::MissingPayload {
                event: other.kind(),
                field: "installation",
            }),
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    action: String,
    #[serde(default)]
    sender: Option<Actor>,
    #[serde(default)]
    repository: Option<Repository>,
    #[serde(default)]
    organization: Option<Organization>,
    #[serde(default)]
    workflow_job: Option<WorkflowJob>,
    #[serde(default)]
    installation: Option<Installation>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Decodes `body` as an event of the given kind.
///
/// Payload subtrees for every known kind may be present or absent. Only the
/// typing of fields that are present is enforced here.
pub fn decode_event(kind: EventKind, body: &[u8]) -> Result<EventEnvelope, ParseError> {
    let raw: RawEnvelope = serde_json::from_slice(body)?;

    let context = EventContext {
        action: raw.action,
        sender: raw.sender,
        repository: raw.repository,
        organization: raw.organization,
        extra: raw.extra,
    };

    Ok(match kind {
        EventKind::WorkflowJob => EventEnvelope::WorkflowJob {
            context,
            workflow_job: raw.workflow_job,
        },
        EventKind::Installation => EventEnvelope::Installation {
            context,
            installation: raw.installation,
        },
    })
}
