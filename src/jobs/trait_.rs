//! Control-plane trait definition
//!
//! Defines the interface to the remote job-execution control plane. Both
//! mutating calls return a long-running [`Operation`] that must be awaited
//! through [`JobsControlPlane::wait_operation`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::jobs::spec::JobSpec;
use crate::metadata::MetadataError;

/// A long-running operation handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Terminal error carried by a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("job {name} already exists")]
    AlreadyExists { name: String },

    #[error("control plane returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("operation {name} failed with code {code}: {message}")]
    OperationFailed {
        name: String,
        code: i32,
        message: String,
    },

    #[error("failed to obtain access token: {0}")]
    Auth(#[from] MetadataError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid control plane URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ControlPlaneError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ControlPlaneError::AlreadyExists { .. })
    }
}

/// Remote job-execution control plane.
#[async_trait]
pub trait JobsControlPlane: Send + Sync {
    /// Starts creating `job_id` under `parent`. Fails with
    /// [`ControlPlaneError::AlreadyExists`] when the name is taken.
    async fn create_job(
        &self,
        parent: &str,
        job_id: &str,
        spec: &JobSpec,
    ) -> Result<Operation, ControlPlaneError>;

    /// Starts one execution of the fully qualified job `name`.
    async fn run_job(&self, name: &str) -> Result<Operation, ControlPlaneError>;

    /// Waits for `operation` to finish and returns its response.
    async fn wait_operation(&self, operation: Operation) -> Result<Value, ControlPlaneError>;
}
