use opentelemetry_semantic_conventions::{
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use std::{
    fs::File,
    path::Path,
    sync::{mpsc, OnceLock},
};

use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

static SUBSCRIBER_SET: OnceLock<()> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

const LOG_ENV: &str = "KUBEMUX_LOG";
const SERVICE: &str = "kubemux";

fn resource() -> Resource {
    Resource::builder()
        .with_schema_url(
            [
                KeyValue::new(SERVICE_NAME, SERVICE),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ],
            SCHEMA_URL,
        )
        .with_service_name(SERVICE)
        .build()
}

fn init_tracer_provider(ep: &str) -> Result<SdkTracerProvider, BoxError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(ep)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(1.0))))
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Same layers as the plain logger plus an OTLP span exporter to `endpoint`.
pub fn setup_logger(log_dir: Option<&Path>, endpoint: &str) -> Result<(), BoxError> {
    if SUBSCRIBER_SET.get().is_some() {
        return Ok(());
    }

    // The exporter lives on its own runtime so it outlives request tasks.
    let (tx, rx) = mpsc::sync_channel(1);
    let endpoint_owned = endpoint.to_owned();
    std::thread::Builder::new()
        .name("otel-worker".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tx.send(Err(BoxError::from(e))).ok();
                    return;
                }
            };

            rt.block_on(async move {
                tx.send(init_tracer_provider(&endpoint_owned)).ok();
                std::future::pending::<()>().await;
            });
        })?;

    let provider = rx.recv()??;
    TRACER_PROVIDER.set(provider.clone()).ok();

    let file_layer = match log_dir {
        Some(dir) => {
            let file = File::create(dir.join("kubemux.log"))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            LOG_GUARD.set(guard).ok();
            Some(
                fmt::layer()
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter());
    let otel_layer = OpenTelemetryLayer::new(provider.tracer(SERVICE)).with_filter(env_filter());

    SUBSCRIBER_SET.get_or_init(|| {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .with(otel_layer)
            .try_init()
            .ok();
    });

    Ok(())
}

/// Flush pending spans; call before process exit.
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("otel shutdown: {e}");
        }
    }
}
