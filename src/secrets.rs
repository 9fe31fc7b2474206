//! # Secret Provider
//!
//! Resolves secret references to raw bytes. References are either a bare
//! secret name in the service's own project or a fully qualified resource
//! name, optionally pinned to a version.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use crate::metadata::{AccessTokenProvider, MetadataError};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to obtain access token: {0}")]
    Auth(#[from] MetadataError),
    #[error("secret request for {name} failed: {source}")]
    Network {
        name: String,
        source: reqwest::Error,
    },
    #[error("secret store returned {status} for {name}: {message}")]
    Api {
        name: String,
        status: u16,
        message: String,
    },
    #[error("secret {name} has a malformed payload: {reason}")]
    MalformedPayload { name: String, reason: String },
}

/// Resolves a secret reference to its current bytes.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn read_secret(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretError>;
}

/// Expands a secret reference to a versioned resource name.
///
/// `name` becomes `projects/{project}/secrets/name/versions/latest`;
/// `projects/p/secrets/name` gains `/versions/latest`; a reference that
/// already names a version is returned unchanged.
pub fn qualify_secret_name(project: &str, name: &str) -> String {
    let mut qualified = if name.starts_with("projects/") {
        name.to_string()
    } else {
        format!("projects/{}/secrets/{}", project, name)
    };
    if qualified.split('/').count() < 6 {
        qualified.push_str("/versions/latest");
    }
    qualified
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: Option<SecretPayload>,
}

#[derive(Deserialize)]
struct SecretPayload {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
}

/// Secret Manager over its REST interface.
pub struct SecretManagerClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl SecretManagerClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        project: impl Into<String>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            tokens,
        }
    }
}

#[async_trait]
impl SecretProvider for SecretManagerClient {
    async fn read_secret(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let qualified = qualify_secret_name(&self.project, name);
        info!(secret = %qualified, "Accessing secret");

        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(format!("{}/v1/{}:access", self.base_url, qualified))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| SecretError::Network {
                name: qualified.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GoogleErrorBody>(&body)
                .map(|parsed| parsed.error.message)
                .unwrap_or(body);
            return Err(SecretError::Api {
                name: qualified,
                status: status.as_u16(),
                message,
            });
        }

        let parsed: AccessResponse =
            response
                .json()
                .await
                .map_err(|err| SecretError::MalformedPayload {
                    name: qualified.clone(),
                    reason: err.to_string(),
                })?;
        let encoded = parsed.payload.map(|p| p.data).unwrap_or_default();
        let decoded = general_purpose::STANDARD.decode(encoded.as_bytes()).map_err(|err| {
            SecretError::MalformedPayload {
                name: qualified.clone(),
                reason: err.to_string(),
            }
        })?;

        Ok(Zeroizing::new(decoded))
    }
}
