//! Jobs module
//!
//! This module covers the remote job-execution control plane:
//! - The `JobsControlPlane` trait and its long-running `Operation` model
//! - The materialized job definition built from configuration
//! - A Cloud Run Admin API client
//! - The orchestrator driving the ensure-then-run protocol

pub mod cloud_run;
pub mod orchestrator;
pub mod spec;
pub mod trait_;

pub use cloud_run::CloudRunClient;
pub use orchestrator::{EnsureOutcome, JobLocation, JobOrchestrator, OrchestratorError};
pub use spec::{JobSpec, TOKEN_SECRET_ENV_VAR};
pub use trait_::{ControlPlaneError, JobsControlPlane, Operation, OperationStatus};
