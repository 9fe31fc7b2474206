//! # Server Configuration
//!
//! Router construction, startup wiring and the serve loop.

use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::any};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::gate::DeliveryGate;
use crate::github_app::RegistrationTokenIssuer;
use crate::handlers;
use crate::identity::derive_identity;
use crate::jobs::{CloudRunClient, JobOrchestrator};
use crate::metadata::{MetadataClient, resolve_location};
use crate::secrets::{SecretManagerClient, SecretProvider};

/// Shared state handed to every handler. Everything in it is immutable or
/// safe for concurrent use.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub secrets: Arc<dyn SecretProvider>,
    pub gate: Arc<DeliveryGate>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub tokens: Arc<RegistrationTokenIssuer>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        secrets: Arc<dyn SecretProvider>,
        orchestrator: Arc<JobOrchestrator>,
        tokens: Arc<RegistrationTokenIssuer>,
    ) -> Self {
        let gate = Arc::new(DeliveryGate::for_webhooks(&config, secrets.clone()));
        Self {
            config,
            secrets,
            gate,
            orchestrator,
            tokens,
        }
    }
}

/// Creates the router. Both routes accept any method so that a wrong method
/// gets the service's own 400 rather than a 405.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", any(handlers::webhooks::handle_webhook))
        .route("/token", any(handlers::token::issue_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wires the production clients, ensures the job definition and serves
/// until Ctrl-C or SIGTERM.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("runner-launcher/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let metadata = Arc::new(MetadataClient::new(http.clone(), &config.metadata_base));
    let config = resolve_location(config, &metadata)
        .await
        .context("failed to resolve control-plane location")?;
    let config = Arc::new(config);

    let identity = derive_identity(&config).context("failed to derive job identity")?;
    info!(job = %identity, "Derived job identity");

    let (project, _) = config.control_plane_location()?;
    let secrets: Arc<dyn SecretProvider> = Arc::new(SecretManagerClient::new(
        http.clone(),
        &config.secret_manager_api_base,
        project,
        metadata.clone(),
    ));
    let control_plane = Arc::new(CloudRunClient::new(
        http.clone(),
        &config.run_api_base,
        metadata,
        config.operation_poll_interval(),
    ));
    let orchestrator = Arc::new(JobOrchestrator::new(control_plane, &config, identity)?);

    if config.ensure_job_on_startup {
        let outcome = orchestrator
            .ensure_job_definition()
            .await
            .context("failed to ensure job definition")?;
        info!(job = %orchestrator.job_name(), outcome = ?outcome, "Job definition ready");
    } else {
        info!("Skipping job definition check; ENSURE_JOB_ON_STARTUP is false");
    }

    let tokens = Arc::new(RegistrationTokenIssuer::new(
        http,
        &config.github_api_base,
        config.github_app_jwt_ttl(),
    ));

    let state = AppState::new(config.clone(), secrets, orchestrator, tokens);
    let app = create_app(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
