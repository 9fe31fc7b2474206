//! # Job Identity
//!
//! Derives the name of the remote job definition from configuration. The
//! name is the base job id followed by a content hash of every setting that
//! shapes the job, so a changed image, limit or secret reference yields a new
//! job definition instead of mutating an existing one.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{AppConfig, JOB_VERSION_SUFFIX_LEN};

/// Revision of the job template built in [`crate::jobs::spec`]. Bump it
/// whenever the materialized job changes shape so deployments re-version.
pub const JOB_TEMPLATE_REVISION: &str = "2";

const VERSION_BYTES: usize = 16;

/// Hex digest identifying one configuration of the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobVersion(String);

impl JobVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `<base job id>-<JobVersion>`: the job name on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    base: String,
    version: JobVersion,
}

impl JobIdentity {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn version(&self) -> &JobVersion {
        &self.version
    }

    pub fn as_job_id(&self) -> String {
        format!("{}-{}", self.base, self.version.as_str())
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.version.as_str())
    }
}

/// Canonical form of the hashed settings. Field order here is the hash order.
#[derive(Serialize)]
struct VersionedSettings<'a> {
    template_revision: &'a str,
    job_id: &'a str,
    repository_url: &'a str,
    runner_image_url: &'a str,
    github_token_secret: &'a str,
    hook_id: Option<&'a str>,
    github_signature_secret: Option<&'a str>,
    github_app_private_key: Option<&'a str>,
    job_timeout_seconds: u64,
    job_cpu: &'a str,
    job_memory: &'a str,
    project_id: Option<&'a str>,
    location: Option<&'a str>,
}

impl<'a> From<&'a AppConfig> for VersionedSettings<'a> {
    fn from(config: &'a AppConfig) -> Self {
        Self {
            template_revision: JOB_TEMPLATE_REVISION,
            job_id: &config.job_id,
            repository_url: &config.repository_url,
            runner_image_url: &config.runner_image_url,
            github_token_secret: &config.github_token_secret,
            hook_id: config.hook_id.as_deref(),
            github_signature_secret: config.github_signature_secret.as_deref(),
            github_app_private_key: config.github_app_private_key.as_deref(),
            job_timeout_seconds: config.job_timeout_seconds,
            job_cpu: &config.job_cpu,
            job_memory: &config.job_memory,
            project_id: config.project_id.as_deref(),
            location: config.location.as_deref(),
        }
    }
}

/// Hashes the job-shaping settings of `config`.
pub fn derive_version(config: &AppConfig) -> serde_json::Result<JobVersion> {
    let canonical = serde_json::to_vec(&VersionedSettings::from(config))?;
    let digest = Sha256::digest(&canonical);
    Ok(JobVersion(hex::encode(&digest[..VERSION_BYTES])))
}

/// Derives the job identity for `config`. Pure: equal settings give equal identities.
pub fn derive_identity(config: &AppConfig) -> serde_json::Result<JobIdentity> {
    let version = derive_version(config)?;
    debug_assert_eq!(version.as_str().len() + 1, JOB_VERSION_SUFFIX_LEN);
    Ok(JobIdentity {
        base: config.job_id.clone(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            repository_url: "https://github.com/acme/widgets".to_string(),
            runner_image_url: "us-docker.pkg.dev/acme/runners/runner:1.0".to_string(),
            github_token_secret: "runner-pat".to_string(),
            project_id: Some("acme-ci".to_string()),
            location: Some("us-central1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_shape() {
        let identity = derive_identity(&base_config()).unwrap();
        let job_id = identity.as_job_id();
        assert!(job_id.starts_with("runner-"));
        assert_eq!(identity.version().as_str().len(), 32);
        assert!(
            identity
                .version()
                .as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
        assert_eq!(identity.to_string(), job_id);
        assert!(job_id.len() <= crate::config::MAX_JOB_NAME_LEN);
    }

    #[test]
    fn test_equal_configs_equal_identities() {
        let a = derive_identity(&base_config()).unwrap();
        let b = derive_identity(&base_config().clone()).unwrap();
        assert_eq!(a, b);
    }

    fn assert_changes_identity(name: &str, mutate: impl FnOnce(&mut AppConfig)) {
        let baseline = derive_identity(&base_config()).unwrap();
        let mut config = base_config();
        mutate(&mut config);
        let changed = derive_identity(&config).unwrap();
        assert_ne!(changed, baseline, "changing {name} kept the identity");
    }

    #[test]
    fn test_every_job_setting_changes_identity() {
        assert_changes_identity("job_id", |c| c.job_id = "builder".to_string());
        assert_changes_identity("repository_url", |c| {
            c.repository_url = "https://github.com/acme/gadgets".to_string()
        });
        assert_changes_identity("runner_image_url", |c| c.runner_image_url.push_str("-rc1"));
        assert_changes_identity("github_token_secret", |c| {
            c.github_token_secret = "other-pat".to_string()
        });
        assert_changes_identity("hook_id", |c| c.hook_id = Some("1".to_string()));
        assert_changes_identity("github_signature_secret", |c| {
            c.github_signature_secret = Some("hmac".to_string())
        });
        assert_changes_identity("github_app_private_key", |c| {
            c.github_app_private_key = Some("app-key".to_string())
        });
        assert_changes_identity("job_timeout", |c| c.job_timeout_seconds = 900);
        assert_changes_identity("job_cpu", |c| c.job_cpu = "2".to_string());
        assert_changes_identity("job_memory", |c| c.job_memory = "2Gi".to_string());
        assert_changes_identity("project_id", |c| {
            c.project_id = Some("acme-prod".to_string())
        });
        assert_changes_identity("location", |c| {
            c.location = Some("europe-west1".to_string())
        });
    }

    #[test]
    fn test_ambient_settings_do_not_change_identity() {
        let baseline = derive_identity(&base_config()).unwrap();
        let config = AppConfig {
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
            port: 9090,
            operation_poll_interval_ms: 250,
            ..base_config()
        };
        assert_eq!(derive_identity(&config).unwrap(), baseline);
    }

    #[test]
    fn test_none_and_empty_hook_id_differ() {
        let none = derive_identity(&base_config()).unwrap();
        let empty = derive_identity(&AppConfig {
            hook_id: Some(String::new()),
            ..base_config()
        })
        .unwrap();
        assert_ne!(none, empty);
    }
}
