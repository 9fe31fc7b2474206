//! Cloud Run Admin API v2 client
//!
//! Implements [`JobsControlPlane`] over REST. Jobs are created with
//! `POST /v2/{parent}/jobs?jobId=`, executions started with
//! `POST /v2/{job}:run`, and operations polled with `GET /v2/{operation}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::jobs::spec::JobSpec;
use crate::jobs::trait_::{ControlPlaneError, JobsControlPlane, Operation};
use crate::metadata::AccessTokenProvider;

const ALREADY_EXISTS: &str = "ALREADY_EXISTS";

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

pub struct CloudRunClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
    poll_interval: Duration,
}

impl CloudRunClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn AccessTokenProvider>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            poll_interval,
        }
    }

    fn url(&self, resource: &str) -> Result<Url, ControlPlaneError> {
        Ok(Url::parse(&format!("{}/v2/{}", self.base_url, resource))?)
    }

    /// Decodes an operation, or maps a non-2xx response to a typed error.
    async fn operation_from(
        response: reqwest::Response,
        resource: &str,
    ) -> Result<Operation, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Operation>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<GoogleErrorBody>(&body) {
            Ok(parsed) => (parsed.error.status, parsed.error.message),
            Err(_) => (String::new(), body),
        };

        if status == StatusCode::CONFLICT || code == ALREADY_EXISTS {
            return Err(ControlPlaneError::AlreadyExists {
                name: resource.to_string(),
            });
        }

        Err(ControlPlaneError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

#[async_trait]
impl JobsControlPlane for CloudRunClient {
    async fn create_job(
        &self,
        parent: &str,
        job_id: &str,
        spec: &JobSpec,
    ) -> Result<Operation, ControlPlaneError> {
        let mut url = self.url(&format!("{}/jobs", parent))?;
        url.query_pairs_mut().append_pair("jobId", job_id);
        let token = self.tokens.access_token().await?;

        info!(parent = %parent, job_id = %job_id, "Creating job definition");
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(spec)
            .send()
            .await?;

        Self::operation_from(response, &format!("{}/jobs/{}", parent, job_id)).await
    }

    async fn run_job(&self, name: &str) -> Result<Operation, ControlPlaneError> {
        let url = self.url(&format!("{}:run", name))?;
        let token = self.tokens.access_token().await?;

        info!(job = %name, "Starting job execution");
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        Self::operation_from(response, name).await
    }

    async fn wait_operation(&self, mut operation: Operation) -> Result<Value, ControlPlaneError> {
        loop {
            if operation.done {
                if let Some(status) = operation.error {
                    warn!(
                        operation = %operation.name,
                        code = status.code,
                        message = %status.message,
                        "Operation finished with an error"
                    );
                    return Err(ControlPlaneError::OperationFailed {
                        name: operation.name,
                        code: status.code,
                        message: status.message,
                    });
                }
                debug!(operation = %operation.name, "Operation finished");
                return Ok(operation.response.unwrap_or(Value::Null));
            }

            tokio::time::sleep(self.poll_interval).await;

            let url = self.url(&operation.name)?;
            let token = self.tokens.access_token().await?;
            let response = self.http.get(url).bearer_auth(token).send().await?;
            let name = operation.name.clone();
            operation = Self::operation_from(response, &name).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::identity::derive_identity;
    use crate::metadata::StaticAccessToken;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    const PARENT: &str = "projects/acme-ci/locations/us-central1";

    fn client_for(server: &MockServer) -> CloudRunClient {
        CloudRunClient::new(
            reqwest::Client::new(),
            server.uri(),
            Arc::new(StaticAccessToken("run-token".to_string())),
            Duration::from_millis(5),
        )
    }

    fn spec() -> JobSpec {
        let config = AppConfig {
            repository_url: "https://github.com/acme/widgets".to_string(),
            runner_image_url: "runner:1".to_string(),
            github_token_secret: "runner-pat".to_string(),
            ..Default::default()
        };
        JobSpec::from_config(&config, &derive_identity(&config).unwrap())
    }

    #[tokio::test]
    async fn test_create_job_posts_spec() {
        let server = MockServer::start().await;
        let spec = spec();
        Mock::given(method("POST"))
            .and(path(format!("/v2/{}/jobs", PARENT)))
            .and(query_param("jobId", "runner-abc"))
            .and(header("authorization", "Bearer run-token"))
            .and(body_json(serde_json::to_value(&spec).unwrap()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": format!("{}/operations/op-1", PARENT),
                "done": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let operation = client_for(&server)
            .create_job(PARENT, "runner-abc", &spec)
            .await
            .unwrap();
        assert_eq!(operation.name, format!("{}/operations/op-1", PARENT));
        assert!(!operation.done);
    }

    #[tokio::test]
    async fn test_create_job_conflict_is_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": {
                    "code": 409,
                    "message": "Resource 'runner-abc' already exists.",
                    "status": "ALREADY_EXISTS"
                }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_job(PARENT, "runner-abc", &spec())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": 403,
                    "message": "Permission 'run.jobs.run' denied",
                    "status": "PERMISSION_DENIED"
                }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .run_job(&format!("{}/jobs/runner-abc", PARENT))
            .await
            .unwrap_err();
        match err {
            ControlPlaneError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 403);
                assert_eq!(code, "PERMISSION_DENIED");
                assert!(message.contains("run.jobs.run"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_then_poll_until_done() {
        let server = MockServer::start().await;
        let job = format!("{}/jobs/runner-abc", PARENT);
        let op_name = format!("{}/operations/op-2", PARENT);

        Mock::given(method("POST"))
            .and(path(format!("/v2/{}:run", job)))
            .and(body_json(json!({})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"name": op_name, "done": false})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}", op_name)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": op_name})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}", op_name)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": op_name,
                "done": true,
                "response": {"name": format!("{}/executions/runner-abc-x1", job)}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let operation = client.run_job(&job).await.unwrap();
        let response = client.wait_operation(operation).await.unwrap();
        assert_eq!(
            response["name"],
            json!(format!("{}/executions/runner-abc-x1", job))
        );
    }

    #[tokio::test]
    async fn test_failed_operation_is_an_error() {
        let server = MockServer::start().await;
        let operation = Operation {
            name: format!("{}/operations/op-3", PARENT),
            done: true,
            error: Some(crate::jobs::OperationStatus {
                code: 9,
                message: "image not found".to_string(),
            }),
            response: None,
            metadata: None,
        };

        let err = client_for(&server)
            .wait_operation(operation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::OperationFailed { code: 9, .. }
        ));
    }
}
