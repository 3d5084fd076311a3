//! Logging and optional OpenTelemetry export
//!
//! Console logs always go to stdout. When an OTLP endpoint is configured,
//! spans (connections, chat turns, executions) are also exported so a
//! command can be followed from the gateway into the sandbox.
//!
//! ```text
//! shellvisor ─► fmt layer ─► stdout (text or JSON lines)
//!            └► OTLP (gRPC) ─► collector ─► Tempo / Jaeger
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging, exporting spans when `otlp_endpoint` is set
///
/// `RUST_LOG` wins over `log_level` when present.
///
/// # Arguments
/// * `service_name` - Name for the service in traces
/// * `log_level` - Level for this crate's targets (e.g. "info", "debug")
/// * `otlp_endpoint` - OTLP gRPC endpoint, or `None` for console only
/// * `json` - Emit JSON lines instead of human-readable logs
pub fn init_tracing(
    service_name: &str,
    log_level: &str,
    otlp_endpoint: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .init();

    if let Some(endpoint) = otlp_endpoint {
        tracing::info!(
            service = service_name,
            endpoint,
            "OpenTelemetry tracing initialized"
        );
    }
    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn default_directives(log_level: &str) -> String {
    format!("warn,shellvisor={}", log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives("debug");
        assert_eq!(directives, "warn,shellvisor=debug");
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
