use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ingest::config::Config;
use ingest::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

/// OTLP exporter for spans at `LOG_LEVEL` and above, sampled per trace.
fn otel_tracer(config: &Config, endpoint: &str) -> anyhow::Result<Tracer> {
    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        Value::from(config.otel_service_name.clone()),
    )]);
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        config.otel_sampling_rate,
    )));

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)?;
    Ok(tracer)
}

/// Logs go to stdout filtered by `RUST_LOG` (INFO when unset). Spans are
/// exported over OTLP only when `OTEL_URL` is configured.
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );

    let otel_layer = match config.otel_url.as_deref() {
        Some(endpoint) => Some(
            OpenTelemetryLayer::new(otel_tracer(config, endpoint)?)
                .with_filter(LevelFilter::from_level(config.log_level)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.address).await?;
    serve(config, listener, shutdown()).await
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(&config).expect("failed to initialise tracing");

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "ingest server failed");
        std::process::exit(1);
    }
    tracing::info!("shutdown complete");
}
