//! Process-wide logging setup
//!
//! Log lines go to stdout as JSON, filtered by `RUST_LOG`. When an OTLP
//! collector is configured, spans are exported to it as well, tagged with the
//! service name of the running subcommand.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,tether=debug,hyper=warn,reqwest=warn,tungstenite=warn";

/// Environment variable naming the OTLP collector
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP exporter could not be built
    #[error("otlp exporter for {endpoint}: {message}")]
    Exporter {
        /// Collector endpoint
        endpoint: String,
        /// Underlying error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// What to tag exported spans with and where to send them
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of exported spans, e.g. `tether-relay`
    pub service_name: String,
    /// Collector endpoint; `None` keeps everything local
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Config for `service_name`, reading the collector from the environment
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|endpoint| !endpoint.is_empty()),
        }
    }
}

/// Install the global subscriber. Call once, inside the tokio runtime.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => Some(otlp_tracer(endpoint, &config.service_name)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true),
        )
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Ok(host) = std::env::var("HOSTNAME") {
        attributes.push(KeyValue::new("host.name", host));
    }
    Resource::new(attributes)
}

fn otlp_tracer(endpoint: &str, service_name: &str) -> Result<Tracer, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource(service_name))
        .build();

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(service_name.to_string()))
}
