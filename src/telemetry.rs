//! Structured logging for the launcher.
//!
//! Every delivery runs inside a [`TraceContext`] keyed by its
//! `X-GitHub-Delivery` id. Error responses echo that id in `x-trace-id` so a
//! failed delivery in GitHub's UI can be matched to its log lines.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing::warn;
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Trace context carrying the correlation id of the delivery being handled.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Uses the provider's delivery id when present, otherwise a fresh UUID.
    pub fn from_delivery_id(delivery_id: Option<&str>) -> Self {
        let trace_id = delivery_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self { trace_id }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber once. Later calls are no-ops.
///
/// `RUST_LOG` takes precedence over `LOG_LEVEL`. With `LOG_FORMAT=json` every
/// event is a single flattened object carrying the enclosing `webhook` or
/// `token` span, so the delivery id lands on each line.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let bridge_error = install_log_bridge();

    if let Err(err) = tracing_subscriber::registry()
        .with(output_layer(&config.log_format))
        .with(level_filter(&config.log_level))
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(err.into());
    }

    if let Some(err) = bridge_error {
        warn!(error = %err, "log records from dependencies will not be captured");
    }
    Ok(())
}

/// Routes `log` records from dependencies into tracing. A bridge that is
/// already installed counts as success.
fn install_log_bridge() -> Option<log::SetLoggerError> {
    let err = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
        .err()?;
    let current = type_name_of_val(log::logger());
    (!current.contains("LogTracer")).then_some(err)
}

fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn output_layer(log_format: &str) -> BoxedLayer {
    match log_format {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

/// Execute `future` within the provided trace context.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Get the trace id of the running task, if one has been set.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}
