//! Logging and distributed tracing for the fiscal registry
//!
//! Structured logs go to stdout (compact or JSON). When an OTLP endpoint is
//! configured, the `#[instrument]` spans of the registry, worker and
//! transport are exported as well.
//!
//! # Configuration
//!
//! - `LOG_LEVEL` / `RUST_LOG` - Filter directives (default: info)
//! - `LOG_JSON` - Emit JSON lines
//! - `LOG_CONSOLE` - Set to `false` to disable stdout logging
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - Enables span export
//! - `OTEL_SAMPLE_RATE` - Trace sampling ratio (default: 1.0)
//! - `OTEL_SERVICE_NAME` / `OTEL_SERVICE_VERSION` - Reported service identity
//! - `REGISTRY_DEPLOYMENT` - `deployment.environment` resource attribute

use std::time::Duration;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{self as sdktrace, RandomIdGenerator, Sampler},
    Resource,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

const DEFAULT_SERVICE_NAME: &str = "fiscal-registry";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// OTLP/gRPC collector, e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
    /// Clamped to `0.0..=1.0` when the sampler is built
    pub sample_rate: f64,
    pub enable_console: bool,
    pub json_format: bool,
    /// Used when `RUST_LOG` is not set
    pub log_level: String,
    pub deployment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: None,
            sample_rate: 1.0,
            enable_console: true,
            json_format: false,
            log_level: "info".to_string(),
            deployment: "development".to_string(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: std::env::var("OTEL_SERVICE_VERSION")
                .unwrap_or(defaults.service_version),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.trim().is_empty()),
            sample_rate: std::env::var("OTEL_SAMPLE_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sample_rate),
            enable_console: env_flag("LOG_CONSOLE").unwrap_or(defaults.enable_console),
            json_format: env_flag("LOG_JSON").unwrap_or(defaults.json_format),
            log_level: std::env::var("LOG_LEVEL")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or(defaults.log_level),
            deployment: std::env::var("REGISTRY_DEPLOYMENT").unwrap_or(defaults.deployment),
        }
    }
}

/// Install the global subscriber. Call once, before any other work.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = config.enable_console.then(|| {
        if config.json_format {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer().compact().with_target(true).boxed()
        }
    });

    let export = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = init_tracer_provider(config, endpoint)?;
            Some(OpenTelemetryLayer::new(provider.tracer(DEFAULT_SERVICE_NAME)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(export)
        .try_init()?;

    tracing::debug!(
        service = %config.service_name,
        otlp = config.otlp_endpoint.is_some(),
        "Telemetry initialized"
    );
    Ok(())
}

fn init_tracer_provider(
    config: &TelemetryConfig,
    endpoint: &str,
) -> anyhow::Result<sdktrace::TracerProvider> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.deployment.clone()),
    ]);

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(EXPORT_TIMEOUT),
        )
        .with_trace_config(
            sdktrace::Config::default()
                .with_sampler(sampler_for(config))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(provider)
}

fn sampler_for(config: &TelemetryConfig) -> Sampler {
    match config.sample_rate {
        r if r >= 1.0 => Sampler::AlwaysOn,
        r if r <= 0.0 || r.is_nan() => Sampler::AlwaysOff,
        r => Sampler::TraceIdRatioBased(r),
    }
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
