//! Logging and optional OpenTelemetry export.
//!
//! Without an OTLP endpoint only the fmt layer is installed. With one, traces
//! and logs are exported over gRPC as well.

use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout for OTLP exports - prevents blocking on unavailable endpoints
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE_NAME: &str = "iot-ubusd";

/// Filter directive for a `-v` level: 0=off, 1=error, 2=info, 3=debug, 4+=trace.
pub fn verbosity_filter(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Owns the OTLP providers so pending spans and logs are flushed at exit.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some() || self.logger_provider.is_some()
    }

    /// Flush and stop both exporters. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("trace exporter shutdown failed: {}", e);
            }
        }
        if let Some(provider) = self.logger_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("log exporter shutdown failed: {}", e);
            }
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str, otlp_endpoint: Option<&str>) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(otlp_endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(TelemetryGuard::default());
    };

    let guard = build_providers(otlp_endpoint)?;
    let (Some(tracer_provider), Some(logger_provider)) =
        (&guard.tracer_provider, &guard.logger_provider)
    else {
        return Ok(guard);
    };

    let tracer = tracer_provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(tracer_provider.clone());
    let log_appender =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(logger_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(log_appender)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!("OpenTelemetry export to {}", otlp_endpoint);
    Ok(guard)
}

fn build_providers(otlp_endpoint: &str) -> Result<TelemetryGuard> {
    let resource = Resource::builder_empty()
        .with_service_name(SERVICE_NAME)
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let endpoint = if otlp_endpoint.contains("://") {
        otlp_endpoint.to_string()
    } else {
        format!("http://{}", otlp_endpoint)
    };

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_span_processor(
            opentelemetry_sdk::trace::BatchSpanProcessor::builder(trace_exporter).build(),
        )
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP log exporter")?;

    let logger_provider = SdkLoggerProvider::builder()
        .with_log_processor(
            opentelemetry_sdk::logs::BatchLogProcessor::builder(log_exporter).build(),
        )
        .with_resource(resource)
        .build();

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        logger_provider: Some(logger_provider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_filter(0), "off");
        assert_eq!(verbosity_filter(2), "info");
        assert_eq!(verbosity_filter(3), "debug");
        assert_eq!(verbosity_filter(9), "trace");
    }

    #[test]
    fn test_guard_without_export_is_inert() {
        let mut guard = TelemetryGuard::default();
        assert!(!guard.is_exporting());
        guard.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guard_shuts_down_both_providers() {
        let mut guard = build_providers("127.0.0.1:4317").unwrap();
        assert!(guard.is_exporting());
        let tracer_provider = guard.tracer_provider.clone().unwrap();
        let logger_provider = guard.logger_provider.clone().unwrap();

        guard.shutdown();

        assert!(!guard.is_exporting());
        assert!(tracer_provider.shutdown().is_err(), "tracer provider still running");
        assert!(logger_provider.shutdown().is_err(), "logger provider still running");
    }
}
