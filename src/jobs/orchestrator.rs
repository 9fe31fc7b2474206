//! Job Orchestrator
//!
//! Drives the two-phase protocol against the control plane: an idempotent
//! job-definition upsert at startup, then one execution per qualifying
//! webhook delivery. Neither phase retries; webhook redelivery is the retry
//! path for triggers.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::{AppConfig, ConfigError};
use crate::event::WorkflowJobEvent;
use crate::identity::JobIdentity;
use crate::jobs::spec::JobSpec;
use crate::jobs::trait_::{ControlPlaneError, JobsControlPlane};

/// Project and location the job definition lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLocation {
    pub project: String,
    pub location: String,
}

impl JobLocation {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let (project, location) = config.control_plane_location()?;
        Ok(Self {
            project: project.to_string(),
            location: location.to_string(),
        })
    }

    /// `projects/{project}/locations/{location}`
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.location)
    }

    pub fn job_name(&self, identity: &JobIdentity) -> String {
        format!("{}/jobs/{}", self.parent(), identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to ensure job definition {job}: {source}")]
    Ensure {
        job: String,
        #[source]
        source: ControlPlaneError,
    },
    #[error("failed to run job {job}: {source}")]
    Trigger {
        job: String,
        #[source]
        source: ControlPlaneError,
    },
}

pub struct JobOrchestrator {
    control_plane: Arc<dyn JobsControlPlane>,
    location: JobLocation,
    identity: JobIdentity,
    spec: JobSpec,
}

impl JobOrchestrator {
    pub fn new(
        control_plane: Arc<dyn JobsControlPlane>,
        config: &AppConfig,
        identity: JobIdentity,
    ) -> Result<Self, ConfigError> {
        let location = JobLocation::from_config(config)?;
        let spec = JobSpec::from_config(config, &identity);
        Ok(Self {
            control_plane,
            location,
            identity,
            spec,
        })
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    /// Fully qualified job resource name.
    pub fn job_name(&self) -> String {
        self.location.job_name(&self.identity)
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Creates the job definition unless one with the same identity exists.
    ///
    /// The identity embeds a content hash of the job settings, so an existing
    /// job of the same name already has the wanted shape.
    #[instrument(skip(self), fields(job = %self.identity))]
    pub async fn ensure_job_definition(&self) -> Result<EnsureOutcome, OrchestratorError> {
        let job = self.job_name();
        let wrap = |source| OrchestratorError::Ensure {
            job: job.clone(),
            source,
        };

        let operation = match self
            .control_plane
            .create_job(
                &self.location.parent(),
                &self.identity.as_job_id(),
                &self.spec,
            )
            .await
        {
            Ok(operation) => operation,
            Err(err) if err.is_already_exists() => {
                info!(job = %job, "Job definition already exists");
                return Ok(EnsureOutcome::AlreadyExists);
            }
            Err(err) => return Err(wrap(err)),
        };

        match self.control_plane.wait_operation(operation).await {
            Ok(_) => {
                info!(job = %job, "Created job definition");
                Ok(EnsureOutcome::Created)
            }
            // Lost a creation race with another instance.
            Err(err) if err.is_already_exists() => {
                info!(job = %job, "Job definition already exists");
                Ok(EnsureOutcome::AlreadyExists)
            }
            Err(err) => Err(wrap(err)),
        }
    }

    /// Starts one execution and waits for the operation to finish.
    #[instrument(skip(self, event), fields(job = %self.identity, workflow_job_id = event.workflow_job.id))]
    pub async fn trigger_run(&self, event: &WorkflowJobEvent) -> Result<Value, OrchestratorError> {
        let job = self.job_name();
        let started = Instant::now();

        info!(
            workflow_job_id = event.workflow_job.id,
            run_id = ?event.workflow_job.run_id,
            repository = ?event.context.repository.as_ref().map(|r| r.full_name.as_str()),
            labels = ?event.workflow_job.labels,
            "Triggering job run"
        );

        let result = match self.control_plane.run_job(&job).await {
            Ok(operation) => self.control_plane.wait_operation(operation).await,
            Err(err) => Err(err),
        };
        histogram!("job_run_trigger_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                counter!("job_runs_triggered_total", "outcome" => "succeeded").increment(1);
                info!(job = %job, response = %response, "Job run started");
                Ok(response)
            }
            Err(source) => {
                counter!("job_runs_triggered_total", "outcome" => "failed").increment(1);
                error!(job = %job, error = %source, "Job run failed");
                Err(OrchestratorError::Trigger { job, source })
            }
        }
    }
}
