//! # Registration Token Handler
//!
//! `GET /token?repo=owner/name&installation-id=N&application-id=N` mints a
//! runner registration token through the GitHub App and writes it to the
//! server log. The response body never carries the token.

use std::sync::LazyLock;

use anyhow::{Context, anyhow};
use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde::Deserialize;
use tracing::{Instrument, info, info_span};

use crate::error::{ApiError, trace_headers};
use crate::server::AppState;
use crate::telemetry::{TraceContext, with_trace_context};

pub const SEE_LOGS_BODY: &str = "See logs";

static REPO_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,38})/[A-Za-z0-9._-]{1,100}$"));

/// Raw query. Every field is optional so that validation, not extraction,
/// reports what is missing.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub repo: Option<String>,
    #[serde(rename = "installation-id")]
    pub installation_id: Option<String>,
    #[serde(rename = "application-id")]
    pub application_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TokenRequest {
    pub repo: String,
    pub installation_id: u64,
    pub application_id: u64,
}

fn positive_id(value: Option<&str>, name: &str) -> Result<u64, ApiError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::client(format!("missing {} query parameter", name)))?;
    match value.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::client(format!("invalid {} query parameter", name))),
    }
}

impl TokenQuery {
    pub fn validate(&self) -> Result<TokenRequest, ApiError> {
        let repo = self
            .repo
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ApiError::client("missing repo query parameter"))?;
        let pattern = REPO_PATTERN
            .as_ref()
            .map_err(|err| ApiError::Server(anyhow!("repository pattern failed to compile: {err}")))?;
        if !pattern.is_match(repo) {
            return Err(ApiError::client("invalid repo query parameter"));
        }

        Ok(TokenRequest {
            repo: repo.to_string(),
            installation_id: positive_id(self.installation_id.as_deref(), "installation-id")?,
            application_id: positive_id(self.application_id.as_deref(), "application-id")?,
        })
    }
}

/// Entry point for `/token`.
pub async fn issue_token(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<TokenQuery>,
) -> Response {
    let context = TraceContext::from_delivery_id(None);
    let span = info_span!("token", trace_id = %context.trace_id);

    with_trace_context(
        context,
        async move {
            match handle_token(&state, &method, &query).await {
                Ok(body) => (StatusCode::OK, trace_headers(), body).into_response(),
                Err(err) => err.into_response(),
            }
        }
        .instrument(span),
    )
    .await
}

async fn handle_token(
    state: &AppState,
    method: &Method,
    query: &TokenQuery,
) -> Result<&'static str, ApiError> {
    if *method != Method::GET {
        return Err(ApiError::client(format!("method {} not allowed", method)));
    }
    let request = query.validate()?;

    let key_name = state
        .config
        .github_app_private_key
        .as_deref()
        .ok_or_else(|| anyhow!("GITHUB_APP_PRIVATE_KEY is not configured"))?;
    let private_key = state
        .secrets
        .read_secret(key_name)
        .await
        .with_context(|| format!("failed to read GitHub App private key {}", key_name))?;

    let token = state
        .tokens
        .issue(
            request.application_id,
            request.installation_id,
            &request.repo,
            &private_key,
        )
        .await
        .context("failed to issue registration token")?;

    info!(
        repo = %request.repo,
        installation_id = request.installation_id,
        application_id = request.application_id,
        token = %token,
        "Runner registration token"
    );
    Ok(SEE_LOGS_BODY)
}
