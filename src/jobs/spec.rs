//! Job definition materialized from configuration.
//!
//! Serializes to the Cloud Run Admin API v2 `Job` resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::identity::JobIdentity;

/// Environment variable the runner token secret is exposed as inside the job.
pub const TOKEN_SECRET_ENV_VAR: &str = "TOKEN_SECRET";

const CONTAINER_NAME: &str = "job";
const SECRET_VERSION: &str = "latest";
const EXECUTION_ENVIRONMENT_GEN2: &str = "EXECUTION_ENVIRONMENT_GEN2";
const VERSION_LABEL: &str = "runner-launcher-version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub template: ExecutionTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTemplate {
    /// Zero lets the control plane pick the maximum parallelism.
    pub parallelism: u32,
    pub task_count: u32,
    pub template: TaskTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub containers: Vec<Container>,
    pub max_retries: u32,
    /// Duration in the `"<seconds>s"` wire form.
    pub timeout: String,
    pub execution_environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value_source: EnvVarSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub secret: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    pub limits: BTreeMap<String, String>,
    pub cpu_idle: bool,
    pub startup_cpu_boost: bool,
}

impl JobSpec {
    /// Builds the job definition. Pure in `config` and `identity`.
    pub fn from_config(config: &AppConfig, identity: &JobIdentity) -> Self {
        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: config.runner_image_url.clone(),
            args: runner_args(&config.repository_url),
            env: vec![EnvVar {
                name: TOKEN_SECRET_ENV_VAR.to_string(),
                value_source: EnvVarSource {
                    secret_key_ref: SecretKeySelector {
                        secret: config.github_token_secret.clone(),
                        version: SECRET_VERSION.to_string(),
                    },
                },
            }],
            resources: ResourceRequirements {
                limits: BTreeMap::from([
                    ("cpu".to_string(), config.job_cpu.clone()),
                    ("memory".to_string(), config.job_memory.clone()),
                ]),
                cpu_idle: false,
                startup_cpu_boost: true,
            },
        };

        Self {
            labels: BTreeMap::from([(
                VERSION_LABEL.to_string(),
                identity.version().as_str().to_string(),
            )]),
            template: ExecutionTemplate {
                parallelism: 0,
                task_count: 1,
                template: TaskTemplate {
                    containers: vec![container],
                    // Failed tasks are never retried by the control plane.
                    max_retries: 0,
                    timeout: format!("{}s", config.job_timeout_seconds),
                    execution_environment: EXECUTION_ENVIRONMENT_GEN2.to_string(),
                },
            },
        }
    }
}

/// Startup command for an ephemeral self-hosted runner.
fn runner_args(repository_url: &str) -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!(
            "./config.sh --unattended --disableupdate --ephemeral --url {} --pat ${} --name runner-$(date +%s%N)&& ./run.sh",
            shell_double_quote(repository_url),
            TOKEN_SECRET_ENV_VAR
        ),
    ]
}

fn shell_double_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
