//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! Long-running engine hosts usually want JSON logs for aggregation and a
//! span exporter; local development wants the pretty format and no OTel.
//! Both are one `ObserveConfig` away:
//!
//! ```no_run
//! use procflow_observe::tracing_setup::{init_tracing, LogFormat, ObserveConfig};
//!
//! // Local development: pretty logs, no export.
//! init_tracing(&ObserveConfig::default()).unwrap();
//!
//! // Service deployment: JSON logs plus OTel spans.
//! init_tracing(&ObserveConfig {
//!     format: LogFormat::Json,
//!     enable_otel: true,
//!     ..ObserveConfig::default()
//! })
//! .unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Log line rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line format.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Subscriber configuration for an embedding application.
#[derive(Debug, Clone)]
pub struct ObserveConfig {
    pub format: LogFormat,
    /// Bridge tracing spans to OpenTelemetry (stdout exporter; swap for
    /// OTLP in production).
    pub enable_otel: bool,
    /// Filter applied when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            enable_otel: false,
            default_filter: "info".to_string(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Installs a `fmt` layer in the configured format with target visibility
/// and span close timing, filtered by `RUST_LOG` when set and by
/// `default_filter` otherwise.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(config: &ObserveConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    if config.enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("procflow");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(otel_layer)
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .init();
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Call this before process exit so buffered spans are exported. Safe to
/// call when OTel was never enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
