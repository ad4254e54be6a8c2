use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthRegistry};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::prometheus::setup_metrics_recorder;
use crate::router::{self, RouterOptions};
use crate::sinks::memory::MemorySink;
use crate::sinks::postgres::PostgresSink;
use crate::sinks::Storage;
use crate::time::SystemTime;

/// Serves until `shutdown` resolves, then stops the pipeline and waits for
/// its final flush before returning.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    let metrics = match config.export_prometheus {
        true => Some(setup_metrics_recorder()?),
        false => None,
    };

    if config.memory_sink {
        // Memory sink is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("memory_sink", Duration::from_secs(30))
            .report_status(ComponentStatus::Unhealthy);

        run(config, listener, shutdown, liveness, metrics, MemorySink::new()).await
    } else {
        let sink = PostgresSink::connect(&config.database_url, config.max_pg_connections).await?;
        sink.migrate().await?;

        run(config, listener, shutdown, liveness, metrics, sink).await
    }
}

async fn run<S, F>(
    config: Config,
    listener: TcpListener,
    shutdown: F,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    storage: S,
) -> anyhow::Result<()>
where
    S: Storage + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let storage = Arc::new(storage);
    let assembler_liveness =
        liveness.register("batch_assembler", config.assembler_liveness_deadline());
    let (pipeline, pipeline_task) =
        Pipeline::start(config.pipeline(), storage.clone(), assembler_liveness);

    let app = router::router(
        SystemTime {},
        liveness,
        pipeline,
        storage,
        RouterOptions::from(&config),
        metrics,
    );

    info!("listening on {:?}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("http server stopped, draining pipeline");
    let stats = pipeline_task.shutdown().await;
    info!(
        flushes = stats.flushes,
        attempted = stats.attempted,
        inserted = stats.inserted,
        dropped = stats.dropped,
        "pipeline stopped"
    );

    served?;
    Ok(())
}
