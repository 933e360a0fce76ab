//! Log and span output for the fan-out service.
//!
//! Log lines always go to stdout through a `tracing` fmt layer. When
//! `OTEL_ENABLED` is set, spans are additionally shipped over OTLP/gRPC so
//! session lifetimes and delivery failures can be followed in a collector.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter directives (default: `stream_fanout=info`)
//! - `OTEL_ENABLED`: `true` or `1` turns on span export (default: off)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector address (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Resource service name (default: stream-fanout)
//!
//! # Usage
//!
//! ```ignore
//! use stream_fanout::infrastructure::telemetry;
//!
//! let _guard = telemetry::init()?;
//! tracing::info!("Subscriber registered");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "stream-fanout";

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Used when `RUST_LOG` is unset or does not parse.
const DEFAULT_DIRECTIVES: &str = "stream_fanout=info,h2=warn,tonic=warn";

/// Keeps the span pipeline alive; flushes buffered spans on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans leave the process.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        // The subscriber may already be gone, so report on stderr.
        if let Err(e) = provider.shutdown() {
            eprintln!("span export did not flush cleanly: {e}");
        }
    }
}

/// Why the subscriber could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Exporter construction failed.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
    /// Another global subscriber was installed first.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Where spans go and under which service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Ship spans over OTLP.
    pub enabled: bool,
    /// Collector gRPC address.
    pub otlp_endpoint: String,
    /// Resource `service.name`.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read the `OTEL_*` variables, falling back to [`Default`] per field.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("OTEL_ENABLED").is_ok_and(|raw| is_truthy(&raw)),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.otlp_endpoint),
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn build_tracer_provider(config: &TelemetryConfig) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// Install the global subscriber using [`TelemetryConfig::from_env`].
///
/// Hold the returned guard until shutdown.
pub fn init() -> Result<TelemetryGuard, TelemetryError> {
    init_with_config(&TelemetryConfig::from_env())
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed or the exporter cannot be
/// built. Hold the returned guard until shutdown.
pub fn init_with_config(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let provider = if config.enabled {
        Some(build_tracer_provider(config)?)
    } else {
        None
    };

    let span_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(log_layer)
        .with(span_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(TelemetryGuard { provider })
}

// =============================================================================
// Tests
// =============================================================================
