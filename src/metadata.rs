//! Instance metadata server client.
//!
//! Supplies the project and region the service runs in, and the service
//! account access token used for control-plane and secret-store calls.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{AppConfig, ConfigError};

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const TOKEN_PATH: &str = "/instance/service-accounts/default/token";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request for {path} failed: {source}")]
    Network {
        path: String,
        source: reqwest::Error,
    },
    #[error("metadata server returned {status} for {path}")]
    Status { path: String, status: u16 },
    #[error("metadata server returned an empty value for {path}")]
    EmptyValue { path: String },
    #[error("metadata token response could not be decoded: {0}")]
    InvalidToken(String),
}

/// Source of OAuth access tokens for Google REST APIs.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, MetadataError>;
}

/// A fixed token, for local runs against emulators and for tests.
#[derive(Clone)]
pub struct StaticAccessToken(pub String);

#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn access_token(&self) -> Result<String, MetadataError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl MetadataClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .map_err(|source| MetadataError::Network {
                path: path.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|source| MetadataError::Network {
                path: path.to_string(),
                source,
            })
    }

    /// Fetches a plain metadata value, trimmed.
    pub async fn query(&self, path: &str) -> Result<String, MetadataError> {
        let value = self.get(path).await?.trim().to_string();
        if value.is_empty() {
            return Err(MetadataError::EmptyValue {
                path: path.to_string(),
            });
        }
        Ok(value)
    }

    pub async fn project_id(&self) -> Result<String, MetadataError> {
        self.query("/project/project-id").await
    }

    /// The region the instance runs in. The server answers with a path such
    /// as `projects/659154930685/regions/us-central1`; the last segment is returned.
    pub async fn region(&self) -> Result<String, MetadataError> {
        let path = "/instance/region";
        let full = self.query(path).await?;
        full.rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .ok_or(MetadataError::EmptyValue {
                path: path.to_string(),
            })
    }
}

#[async_trait]
impl AccessTokenProvider for MetadataClient {
    async fn access_token(&self) -> Result<String, MetadataError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let body = self.get(TOKEN_PATH).await?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| MetadataError::InvalidToken(err.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(MetadataError::InvalidToken("empty access_token".to_string()));
        }

        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(
            expires_in = parsed.expires_in,
            "Fetched service account access token"
        );
        *cached = Some(CachedToken {
            value: parsed.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(parsed.access_token)
    }
}

/// Fills in project and location from the metadata server when the
/// environment did not provide them.
pub async fn resolve_location(
    mut config: AppConfig,
    metadata: &MetadataClient,
) -> Result<AppConfig, ConfigError> {
    if config.project_id.is_none() {
        let project = metadata
            .project_id()
            .await
            .map_err(|err| ConfigError::LocationUnavailable {
                key: "PROJECT_ID",
                reason: err.to_string(),
            })?;
        info!(project = %project, "Resolved project from metadata server");
        config.project_id = Some(project);
    }

    if config.location.is_none() {
        let location = metadata
            .region()
            .await
            .map_err(|err| ConfigError::LocationUnavailable {
                key: "LOCATION",
                reason: err.to_string(),
            })?;
        info!(location = %location, "Resolved location from metadata server");
        config.location = Some(location);
    }

    Ok(config)
}
