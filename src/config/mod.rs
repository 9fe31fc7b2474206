//! Configuration loading for the runner launcher.
//!
//! Loads layered `.env` files and the process environment, producing a typed
//! [`AppConfig`]. The configuration is immutable once the process has started.

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;

/// Settings read from the process environment. Values found in `.env` files
/// are accepted regardless of name; the process environment only contributes
/// the keys listed here.
const KNOWN_KEYS: &[&str] = &[
    "PROFILE",
    "REPOSITORY_URL",
    "RUNNER_IMAGE_URL",
    "GITHUB_TOKEN_SECRET",
    "HOOK_ID",
    "GITHUB_SIGNATURE_SECRET",
    "GITHUB_APP_PRIVATE_KEY",
    "JOB_ID",
    "JOB_TIMEOUT",
    "JOB_CPU",
    "JOB_MEMORY",
    "PORT",
    "PROJECT_ID",
    "LOCATION",
    "LOG_LEVEL",
    "LOG_FORMAT",
    "GITHUB_APP_JWT_TTL_SECONDS",
    "OPERATION_POLL_INTERVAL_MS",
    "ENSURE_JOB_ON_STARTUP",
    "GITHUB_API_BASE",
    "RUN_API_BASE",
    "SECRET_MANAGER_API_BASE",
    "METADATA_BASE",
];

/// Longest identifier the control plane accepts for a job.
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Length of the `-<version>` suffix appended to the base job id.
pub const JOB_VERSION_SUFFIX_LEN: usize = 33;

/// GitHub refuses App assertions that expire more than ten minutes out.
pub const MAX_GITHUB_APP_JWT_TTL_SECONDS: u64 = 600;

/// Application configuration derived from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    pub profile: String,
    /// Repository the ephemeral runner registers against.
    pub repository_url: String,
    pub runner_image_url: String,
    /// Secret reference exposed to the job as `TOKEN_SECRET`.
    pub github_token_secret: String,
    /// Expected value of `X-Github-Hook-Id`, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_id: Option<String>,
    /// Secret reference holding the webhook HMAC key. Unset disables signature validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_signature_secret: Option<String>,
    /// Secret reference holding the GitHub App private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_app_private_key: Option<String>,
    /// Base job identifier before the version suffix is appended.
    pub job_id: String,
    pub job_timeout_seconds: u64,
    pub job_cpu: String,
    pub job_memory: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub log_level: String,
    pub log_format: String,
    pub github_app_jwt_ttl_seconds: u64,
    pub operation_poll_interval_ms: u64,
    pub ensure_job_on_startup: bool,
    pub github_api_base: String,
    pub run_api_base: String,
    pub secret_manager_api_base: String,
    pub metadata_base: String,
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_job_id() -> String {
    "runner".to_string()
}

fn default_job_timeout_seconds() -> u64 {
    600
}

fn default_job_cpu() -> String {
    "1".to_string()
}

fn default_job_memory() -> String {
    "1Gi".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_github_app_jwt_ttl_seconds() -> u64 {
    300
}

fn default_operation_poll_interval_ms() -> u64 {
    1000
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_run_api_base() -> String {
    "https://run.googleapis.com".to_string()
}

fn default_secret_manager_api_base() -> String {
    "https://secretmanager.googleapis.com".to_string()
}

fn default_metadata_base() -> String {
    "http://metadata.google.internal/computeMetadata/v1".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            repository_url: String::new(),
            runner_image_url: String::new(),
            github_token_secret: String::new(),
            hook_id: None,
            github_signature_secret: None,
            github_app_private_key: None,
            job_id: default_job_id(),
            job_timeout_seconds: default_job_timeout_seconds(),
            job_cpu: default_job_cpu(),
            job_memory: default_job_memory(),
            port: default_port(),
            project_id: None,
            location: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            github_app_jwt_ttl_seconds: default_github_app_jwt_ttl_seconds(),
            operation_poll_interval_ms: default_operation_poll_interval_ms(),
            ensure_job_on_startup: true,
            github_api_base: default_github_api_base(),
            run_api_base: default_run_api_base(),
            secret_manager_api_base: default_secret_manager_api_base(),
            metadata_base: default_metadata_base(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("required setting {key} is not set")]
    MissingRequired { key: &'static str },
    #[error("invalid duration for {key}: '{value}' (expected e.g. 90s, 10m, 1h30m): {source}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        source: humantime::DurationError,
    },
    #[error("{key} must be a whole number of seconds, got '{value}'")]
    FractionalSeconds { key: &'static str, value: String },
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("invalid integer for {key}: '{value}'")]
    InvalidInteger { key: &'static str, value: String },
    #[error("invalid boolean for {key}: '{value}'")]
    InvalidBoolean { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    ZeroValue { key: &'static str },
    #[error(
        "invalid JOB_ID '{value}': must start with a lowercase letter and contain only lowercase letters, digits and hyphens"
    )]
    InvalidJobId { value: String },
    #[error("JOB_ID '{value}' is too long: at most {max} characters leave room for the version suffix")]
    JobIdTooLong { value: String, max: usize },
    #[error("invalid LOG_FORMAT '{value}': expected 'json' or 'pretty'")]
    InvalidLogFormat { value: String },
    #[error("{key} is not set and could not be read from the metadata server: {reason}")]
    LocationUnavailable { key: &'static str, reason: String },
}

impl AppConfig {
    /// Returns the socket address the HTTP server binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn github_app_jwt_ttl(&self) -> Duration {
        Duration::from_secs(self.github_app_jwt_ttl_seconds)
    }

    pub fn operation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.operation_poll_interval_ms)
    }

    /// Returns the control-plane project and location once both are known.
    pub fn control_plane_location(&self) -> Result<(&str, &str), ConfigError> {
        let project = self
            .project_id
            .as_deref()
            .ok_or(ConfigError::MissingRequired { key: "PROJECT_ID" })?;
        let location = self
            .location
            .as_deref()
            .ok_or(ConfigError::MissingRequired { key: "LOCATION" })?;
        Ok((project, location))
    }

    /// Validates cross-field constraints that parsing alone cannot catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("REPOSITORY_URL", &self.repository_url),
            ("RUNNER_IMAGE_URL", &self.runner_image_url),
            ("GITHUB_TOKEN_SECRET", &self.github_token_secret),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired { key });
            }
        }

        if !is_valid_job_id(&self.job_id) {
            return Err(ConfigError::InvalidJobId {
                value: self.job_id.clone(),
            });
        }
        let max = MAX_JOB_NAME_LEN - JOB_VERSION_SUFFIX_LEN;
        if self.job_id.len() > max {
            return Err(ConfigError::JobIdTooLong {
                value: self.job_id.clone(),
                max,
            });
        }

        if self.job_timeout_seconds == 0 {
            return Err(ConfigError::ZeroValue { key: "JOB_TIMEOUT" });
        }
        if !(1..=MAX_GITHUB_APP_JWT_TTL_SECONDS).contains(&self.github_app_jwt_ttl_seconds) {
            return Err(ConfigError::OutOfRange {
                key: "GITHUB_APP_JWT_TTL_SECONDS",
                value: self.github_app_jwt_ttl_seconds,
                min: 1,
                max: MAX_GITHUB_APP_JWT_TTL_SECONDS,
            });
        }
        if self.operation_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue {
                key: "OPERATION_POLL_INTERVAL_MS",
            });
        }

        match self.log_format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(ConfigError::InvalidLogFormat {
                value: other.to_string(),
            }),
        }
    }

    /// Returns a redacted JSON representation suitable for startup logs.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.hook_id.is_some() {
            config.hook_id = Some("[REDACTED]".to_string());
        }
        serde_json::to_string(&config)
    }
}

fn is_valid_job_id(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.ends_with('-')
}

/// Parses a duration such as `90s`, `10m` or `1h30m`. Cloud Run takes job
/// timeouts in whole seconds, so fractional values are refused.
pub fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let duration =
        humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
            key,
            value: value.to_string(),
            source,
        })?;
    if duration.subsec_nanos() != 0 {
        return Err(ConfigError::FractionalSeconds {
            key,
            value: value.to_string(),
        });
    }
    Ok(duration)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBoolean {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_integer<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger {
            key,
            value: value.to_string(),
        })
}

/// Loads configuration using layered `.env` files and the process environment.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Project and location are left unset
    /// when not provided; see [`crate::metadata::resolve_location`].
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Process environment wins over every file.
        for key in KNOWN_KEYS {
            if let Ok(value) = env::var(key) {
                layered.insert((*key).to_string(), value);
            }
        }

        let mut take = |key: &str| layered.remove(key).filter(|v| !v.trim().is_empty());

        let required = |value: Option<String>, key: &'static str| {
            value.ok_or(ConfigError::MissingRequired { key })
        };

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let repository_url = required(take("REPOSITORY_URL"), "REPOSITORY_URL")?;
        let runner_image_url = required(take("RUNNER_IMAGE_URL"), "RUNNER_IMAGE_URL")?;
        let github_token_secret = required(take("GITHUB_TOKEN_SECRET"), "GITHUB_TOKEN_SECRET")?;
        let hook_id = take("HOOK_ID");
        let github_signature_secret = take("GITHUB_SIGNATURE_SECRET");
        let github_app_private_key = take("GITHUB_APP_PRIVATE_KEY");

        let job_id = take("JOB_ID").unwrap_or_else(default_job_id);
        let job_timeout_seconds = match take("JOB_TIMEOUT") {
            Some(raw) => parse_duration("JOB_TIMEOUT", &raw)?.as_secs(),
            None => default_job_timeout_seconds(),
        };
        let job_cpu = take("JOB_CPU").unwrap_or_else(default_job_cpu);
        let job_memory = take("JOB_MEMORY").unwrap_or_else(default_job_memory);
        let port = match take("PORT") {
            Some(raw) => parse_integer("PORT", &raw)?,
            None => default_port(),
        };

        let project_id = take("PROJECT_ID");
        let location = take("LOCATION");

        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take("LOG_FORMAT").unwrap_or_else(default_log_format);

        let github_app_jwt_ttl_seconds = match take("GITHUB_APP_JWT_TTL_SECONDS") {
            Some(raw) => parse_integer("GITHUB_APP_JWT_TTL_SECONDS", &raw)?,
            None => default_github_app_jwt_ttl_seconds(),
        };
        let operation_poll_interval_ms = match take("OPERATION_POLL_INTERVAL_MS") {
            Some(raw) => parse_integer("OPERATION_POLL_INTERVAL_MS", &raw)?,
            None => default_operation_poll_interval_ms(),
        };
        let ensure_job_on_startup = match take("ENSURE_JOB_ON_STARTUP") {
            Some(raw) => parse_bool("ENSURE_JOB_ON_STARTUP", &raw)?,
            None => true,
        };

        let github_api_base = take("GITHUB_API_BASE").unwrap_or_else(default_github_api_base);
        let run_api_base = take("RUN_API_BASE").unwrap_or_else(default_run_api_base);
        let secret_manager_api_base =
            take("SECRET_MANAGER_API_BASE").unwrap_or_else(default_secret_manager_api_base);
        let metadata_base = take("METADATA_BASE").unwrap_or_else(default_metadata_base);

        let config = AppConfig {
            profile,
            repository_url,
            runner_image_url,
            github_token_secret,
            hook_id,
            github_signature_secret,
            github_app_private_key,
            job_id,
            job_timeout_seconds,
            job_cpu,
            job_memory,
            port,
            project_id,
            location,
            log_level,
            log_format,
            github_app_jwt_ttl_seconds,
            operation_poll_interval_ms,
            ensure_job_on_startup,
            github_api_base: trim_base(github_api_base),
            run_api_base: trim_base(run_api_base),
            secret_manager_api_base: trim_base(secret_manager_api_base),
            metadata_base: trim_base(metadata_base),
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("PROFILE")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    values.insert(key, value);
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_base(value: String) -> String {
    value.trim_end_matches('/').to_string()
}
