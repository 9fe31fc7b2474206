//! End-to-end request flows against mocked Google and GitHub APIs.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use base64::{Engine as _, engine::general_purpose};
use runner_launcher::{
    config::AppConfig,
    github_app::RegistrationTokenIssuer,
    identity::derive_identity,
    jobs::{CloudRunClient, EnsureOutcome, JobOrchestrator},
    metadata::StaticAccessToken,
    secrets::SecretManagerClient,
    server::{AppState, create_app},
    webhook_verification::sign_github_payload,
};
use serde_json::json;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, path_regex, query_param},
};

const WEBHOOK_SECRET: &str = "e2e-webhook-secret";
const PRIVATE_KEY: &str = include_str!("fixtures/github_app_key.pem");

struct Service {
    app: Router,
    orchestrator: Arc<JobOrchestrator>,
}

fn config(google: &MockServer, github: &MockServer) -> AppConfig {
    AppConfig {
        repository_url: "https://github.com/acme/widgets".to_string(),
        runner_image_url: "us-docker.pkg.dev/acme/runners/runner:1.0".to_string(),
        github_token_secret: "runner-pat".to_string(),
        github_signature_secret: Some("webhook-secret".to_string()),
        github_app_private_key: Some("github-app-key".to_string()),
        project_id: Some("acme-ci".to_string()),
        location: Some("us-central1".to_string()),
        operation_poll_interval_ms: 5,
        github_api_base: github.uri(),
        run_api_base: google.uri(),
        secret_manager_api_base: google.uri(),
        ..Default::default()
    }
}

fn service(config: AppConfig) -> Service {
    let http = reqwest::Client::new();
    let tokens = Arc::new(StaticAccessToken("ya29.e2e".to_string()));
    let secrets = Arc::new(SecretManagerClient::new(
        http.clone(),
        &config.secret_manager_api_base,
        "acme-ci",
        tokens.clone(),
    ));
    let control_plane = Arc::new(CloudRunClient::new(
        http.clone(),
        &config.run_api_base,
        tokens,
        config.operation_poll_interval(),
    ));
    let identity = derive_identity(&config).unwrap();
    let orchestrator = Arc::new(JobOrchestrator::new(control_plane, &config, identity).unwrap());
    let issuer = Arc::new(RegistrationTokenIssuer::new(
        http,
        &config.github_api_base,
        Duration::from_secs(300),
    ));

    let state = AppState::new(Arc::new(config), secrets, orchestrator.clone(), issuer);
    Service {
        app: create_app(state),
        orchestrator,
    }
}

async fn mount_secret(server: &MockServer, name: &str, value: &str) {
    Mock::given(method("GET"))
        .and(path(format!(
            "/v1/projects/acme-ci/secrets/{}/versions/latest:access",
            name
        )))
        .and(header("authorization", "Bearer ya29.e2e"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": format!("projects/123/secrets/{}/versions/1", name),
            "payload": {"data": general_purpose::STANDARD.encode(value)}
        })))
        .mount(server)
        .await;
}

fn signed_delivery(event: &str, body: serde_json::Value) -> Request<Body> {
    let bytes = serde_json::to_vec(&body).unwrap();
    let signature = sign_github_payload(&bytes, WEBHOOK_SECRET.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/")
        .header("X-GitHub-Event", event)
        .header("X-GitHub-Delivery", "d0c5a1e0-0000-4000-8000-000000000001")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(bytes))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn ensure_then_trigger_against_cloud_run() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));
    let job_name = service.orchestrator.job_name();
    let job_id = service.orchestrator.identity().as_job_id();

    mount_secret(&google, "webhook-secret", WEBHOOK_SECRET).await;

    Mock::given(method("POST"))
        .and(path("/v2/projects/acme-ci/locations/us-central1/jobs"))
        .and(query_param("jobId", job_id.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme-ci/locations/us-central1/operations/create-1",
            "done": true,
            "response": {"name": job_name}
        })))
        .expect(1)
        .mount(&google)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}:run", job_name)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme-ci/locations/us-central1/operations/run-1",
            "done": false
        })))
        .expect(1)
        .mount(&google)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v2/projects/acme-ci/locations/us-central1/operations/run-1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme-ci/locations/us-central1/operations/run-1",
            "done": true,
            "response": {"name": format!("{}/executions/exec-1", job_name)}
        })))
        .mount(&google)
        .await;

    assert_eq!(
        service.orchestrator.ensure_job_definition().await.unwrap(),
        EnsureOutcome::Created
    );

    let response = service
        .app
        .clone()
        .oneshot(signed_delivery(
            "workflow_job",
            json!({"action": "queued", "workflow_job": {"id": 42, "labels": ["self-hosted"]}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-trace-id"],
        "d0c5a1e0-0000-4000-8000-000000000001"
    );
    assert_eq!(body_text(response).await, "Triggered");

    let response = service
        .app
        .oneshot(signed_delivery(
            "workflow_job",
            json!({"action": "completed", "workflow_job": {"id": 42, "conclusion": "success"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Ignored");
}

#[tokio::test]
async fn existing_job_definition_is_not_an_error() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));

    Mock::given(method("POST"))
        .and(path("/v2/projects/acme-ci/locations/us-central1/jobs"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {"code": 409, "message": "already exists", "status": "ALREADY_EXISTS"}
        })))
        .expect(2)
        .mount(&google)
        .await;

    for _ in 0..2 {
        assert_eq!(
            service.orchestrator.ensure_job_definition().await.unwrap(),
            EnsureOutcome::AlreadyExists
        );
    }
}

#[tokio::test]
async fn failed_run_operation_returns_server_error() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));
    let job_name = service.orchestrator.job_name();

    mount_secret(&google, "webhook-secret", WEBHOOK_SECRET).await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}:run", job_name)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme-ci/locations/us-central1/operations/run-2",
            "done": true,
            "error": {"code": 5, "message": "Job not found"}
        })))
        .expect(1)
        .mount(&google)
        .await;

    let response = service
        .app
        .oneshot(signed_delivery(
            "workflow_job",
            json!({"action": "queued", "workflow_job": {"id": 7}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Server error");
}

#[tokio::test]
async fn unreadable_signature_secret_returns_server_error() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "Permission denied", "status": "PERMISSION_DENIED"}
        })))
        .mount(&google)
        .await;

    let response = service
        .app
        .oneshot(signed_delivery(
            "workflow_job",
            json!({"action": "queued", "workflow_job": {"id": 7}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Server error");
}

#[tokio::test]
async fn token_path_issues_registration_token() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));

    mount_secret(&google, "github-app-key", PRIVATE_KEY).await;
    Mock::given(method("POST"))
        .and(path("/app/installations/777/access_tokens"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"token": "ghs_installation"})),
        )
        .expect(1)
        .mount(&github)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/actions/runners/registration-token"))
        .and(header("authorization", "Bearer ghs_installation"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "AABBCC"})))
        .expect(1)
        .mount(&github)
        .await;

    let response = service
        .app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/token?repo=acme/widgets&installation-id=777&application-id=12345")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert_eq!(body, "See logs");
    assert!(!body.contains("AABBCC"));
}

#[tokio::test]
async fn token_path_github_failure_returns_server_error() {
    let google = MockServer::start().await;
    let github = MockServer::start().await;
    let service = service(config(&google, &github));

    mount_secret(&google, "github-app-key", PRIVATE_KEY).await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})),
        )
        .mount(&github)
        .await;

    let response = service
        .app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/token?repo=acme/widgets&installation-id=777&application-id=12345")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
