//! # GitHub App token issuer
//!
//! Mints a short-lived runner registration token on behalf of a GitHub App
//! installation. The app's RSA key signs an RS256 assertion, which is
//! exchanged for an installation access token, which in turn requests a
//! registration token for one repository.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("runner-launcher/", env!("CARGO_PKG_VERSION"));

/// Backdating applied to `iat` to absorb clock drift against GitHub.
const CLOCK_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum GitHubAppError {
    #[error("invalid GitHub App private key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),

    #[error("assertion lifetime of {seconds}s is out of range")]
    InvalidTtl { seconds: u64 },

    #[error("failed to sign GitHub App assertion: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("GitHub API request to {endpoint} failed with status {status}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("GitHub API response from {endpoint} carried no token")]
    EmptyToken { endpoint: String },
}

/// Claims of the app assertion.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

pub struct RegistrationTokenIssuer {
    http: reqwest::Client,
    api_base: String,
    jwt_ttl: Duration,
}

impl RegistrationTokenIssuer {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, jwt_ttl: Duration) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            jwt_ttl,
        }
    }

    /// Signs an RS256 assertion for `app_id` with the PEM-encoded RSA key.
    pub fn generate_jwt(&self, app_id: u64, private_key_pem: &[u8]) -> Result<String, GitHubAppError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem).map_err(GitHubAppError::InvalidKey)?;
        let now = Utc::now().timestamp();
        let seconds = self.jwt_ttl.as_secs();
        let exp = i64::try_from(seconds)
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or(GitHubAppError::InvalidTtl { seconds })?;
        let claims = AppClaims {
            iat: now - CLOCK_SKEW_SECONDS,
            exp,
            iss: app_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(GitHubAppError::Signing)
    }

    async fn post_for_token(&self, endpoint: String, bearer: &str) -> Result<String, GitHubAppError> {
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(GITHUB_API_VERSION_HEADER, GITHUB_API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubAppError::Api {
                endpoint,
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TokenResponse = response.json().await?;
        if parsed.token.is_empty() {
            return Err(GitHubAppError::EmptyToken { endpoint });
        }
        Ok(parsed.token)
    }

    /// Exchanges an app assertion for an installation access token.
    pub async fn installation_token(
        &self,
        jwt: &str,
        installation_id: u64,
    ) -> Result<String, GitHubAppError> {
        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        debug!(installation_id, "Requesting installation access token");
        self.post_for_token(endpoint, jwt).await
    }

    /// Requests a self-hosted runner registration token for `repo` (`owner/name`).
    pub async fn registration_token(
        &self,
        installation_token: &str,
        repo: &str,
    ) -> Result<String, GitHubAppError> {
        let endpoint = format!(
            "{}/repos/{}/actions/runners/registration-token",
            self.api_base, repo
        );
        debug!(repo = %repo, "Requesting runner registration token");
        self.post_for_token(endpoint, installation_token).await
    }

    /// Runs the full exchange: assertion, installation token, registration token.
    pub async fn issue(
        &self,
        app_id: u64,
        installation_id: u64,
        repo: &str,
        private_key_pem: &[u8],
    ) -> Result<String, GitHubAppError> {
        let jwt = self.generate_jwt(app_id, private_key_pem)?;
        let installation_token = self.installation_token(&jwt, installation_id).await?;
        let token = self.registration_token(&installation_token, repo).await?;
        info!(app_id, installation_id, repo = %repo, "Issued runner registration token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, header_exists, method, path},
    };

    const PRIVATE_KEY: &str = include_str!("../tests/fixtures/github_app_key.pem");
    const PUBLIC_KEY: &str = include_str!("../tests/fixtures/github_app_key.pub.pem");

    fn issuer(base: &str) -> RegistrationTokenIssuer {
        RegistrationTokenIssuer::new(reqwest::Client::new(), base, Duration::from_secs(300))
    }

    #[test]
    fn test_jwt_claims() {
        let jwt = issuer("https://api.github.com")
            .generate_jwt(12345, PRIVATE_KEY.as_bytes())
            .unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&["12345"]);
        let decoded = jsonwebtoken::decode::<AppClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(decoded.header.alg, Algorithm::RS256);
        assert_eq!(decoded.claims.iss, "12345");
        assert!(decoded.claims.iat <= now - 59);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 300 + CLOCK_SKEW_SECONDS);
    }

    #[test]
    fn test_oversized_ttl_is_rejected() {
        let issuer = RegistrationTokenIssuer::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Duration::from_secs(u64::MAX),
        );
        assert!(matches!(
            issuer.generate_jwt(12345, PRIVATE_KEY.as_bytes()),
            Err(GitHubAppError::InvalidTtl { seconds: u64::MAX })
        ));
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let result = issuer("https://api.github.com").generate_jwt(1, b"not a key");
        assert!(matches!(result, Err(GitHubAppError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_issue_full_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/777/access_tokens"))
            .and(header("accept", GITHUB_ACCEPT))
            .and(header("x-github-api-version", GITHUB_API_VERSION))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "ghs_installation",
                "expires_at": "2030-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/actions/runners/registration-token"))
            .and(header("authorization", "Bearer ghs_installation"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "AABBCCREGISTRATION",
                "expires_at": "2030-01-01T01:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = issuer(&server.uri())
            .issue(12345, 777, "acme/widgets", PRIVATE_KEY.as_bytes())
            .await
            .unwrap();
        assert_eq!(token, "AABBCCREGISTRATION");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})),
            )
            .mount(&server)
            .await;

        let err = issuer(&server.uri())
            .installation_token("jwt", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubAppError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_empty_token_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": ""})))
            .mount(&server)
            .await;

        let err = issuer(&server.uri())
            .registration_token("ghs_installation", "acme/widgets")
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubAppError::EmptyToken { .. }));
    }
}
