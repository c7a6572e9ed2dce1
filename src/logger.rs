use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use anyhow::Result;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::EngineConfig;

pub const SERVICE_NAME: &str = "plugin-engine";
pub const LOG_FILE: &str = "plugin-engine.log";
pub const FETCH_EVENT_FILE: &str = "fetch-events.json";

/// Keeps the installed telemetry alive; call `shutdown` to flush exporters.
pub enum TelemetryGuard {
    Otlp(Telemetry),
    Files(FileTelemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Install the global subscriber: OTLP when an endpoint is configured,
/// rolling files otherwise.
pub fn init_tracing(config: &EngineConfig) -> Result<TelemetryGuard> {
    match config.otel_endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => Ok(TelemetryGuard::Otlp(Telemetry::init(
            &config.log_level,
            endpoint,
        )?)),
        None => Ok(TelemetryGuard::Files(FileTelemetry::init_files(
            &config.log_level,
            &config.log_dir,
        )?)),
    }
}

/// Console-only logging for short-lived commands.
pub fn init_console(log_level: &str) {
    let _ = Registry::default()
        .with(EnvFilter::new(log_level))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/logs", end_point.trim_end_matches('/')))
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/traces", end_point.trim_end_matches('/')))
        .build()?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/metrics", end_point.trim_end_matches('/')))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// OTLP over HTTP for logs, traces and the fetch metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        // keep the exporters' own HTTP traffic out of the exported logs
        let otel_logs_layer = {
            let filter = EnvFilter::new(log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
        };

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(e) = self.meter_provider.shutdown() {
            warn!("meter provider shutdown: {e}");
        }
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!("tracer provider shutdown: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            eprintln!("logger provider shutdown: {e}");
        }
    }
}

/// Writes to files only: a daily rolling text log plus a JSON line per
/// network fetch (events with target `fetch`).
pub struct FileTelemetry;

impl FileTelemetry {
    pub fn init_files(log_level: &str, log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let env_filter = EnvFilter::new(log_level);

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false);

        let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, FETCH_EVENT_FILE);
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("fetch=info"));

        let stdout_layer = fmt::layer().with_target(false);

        Registry::default()
            .with(env_filter)
            .with(txt_layer)
            .with(json_layer)
            .with(stdout_layer)
            .try_init()?;

        Ok(FileTelemetry)
    }
}
