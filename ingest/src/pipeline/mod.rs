//! Bounded intake queue feeding a single batch assembler task.

use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dedup::KeyedEvent;
use crate::event::Event;
use crate::sinks::BatchSink;

mod assembler;
mod queue;

pub use assembler::{AssemblerStats, BatchAssembler};
pub use queue::{intake_queue, IntakeQueue};

/// Why an event was not accepted. Both are overload signals for the caller:
/// nothing was queued and the client may retry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    #[error("intake queue is full")]
    QueueFull,
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl Rejected {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejected::QueueFull => "queue_full",
            Rejected::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub batch_max_size: usize,
    pub batch_max_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_max_size: 500,
            batch_max_wait: Duration::from_millis(50),
        }
    }
}

/// Producer handle, cheap to clone into every request handler.
#[derive(Clone)]
pub struct Pipeline {
    queue: IntakeQueue,
    shutdown: CancellationToken,
}

/// Owner side of a running pipeline, used once to stop it.
pub struct PipelineTask {
    shutdown: CancellationToken,
    assembler: JoinHandle<AssemblerStats>,
}

impl Pipeline {
    /// Spawns the batch assembler on the current runtime.
    pub fn start(
        config: PipelineConfig,
        sink: Arc<dyn BatchSink + Send + Sync>,
        liveness: HealthHandle,
    ) -> (Pipeline, PipelineTask) {
        let (queue, receiver) = intake_queue(config.queue_capacity);
        let shutdown = CancellationToken::new();

        let assembler = BatchAssembler::new(
            receiver,
            sink,
            config.batch_max_size,
            config.batch_max_wait,
            shutdown.clone(),
            liveness,
        );
        info!(
            queue_capacity = queue.capacity(),
            batch_max_size = config.batch_max_size,
            batch_max_wait_ms = config.batch_max_wait.as_millis() as u64,
            "starting ingestion pipeline"
        );
        let assembler = tokio::spawn(assembler.run());

        (
            Pipeline {
                queue,
                shutdown: shutdown.clone(),
            },
            PipelineTask {
                shutdown,
                assembler,
            },
        )
    }

    /// Derives the dedup key and queues the event without waiting.
    pub fn submit(&self, event: Event) -> Result<(), Rejected> {
        if self.shutdown.is_cancelled() {
            counter!("ingest_events_rejected_total", "cause" => Rejected::ShuttingDown.as_str())
                .increment(1);
            return Err(Rejected::ShuttingDown);
        }

        let keyed = KeyedEvent::from(event);
        debug!(key = %keyed.key, source = %keyed.key.source(), "submitting event");

        match self.queue.enqueue(keyed) {
            Ok(()) => {
                counter!("ingest_events_enqueued_total").increment(1);
                Ok(())
            }
            Err(rejected) => {
                counter!("ingest_events_rejected_total", "cause" => rejected.as_str())
                    .increment(1);
                Err(rejected)
            }
        }
    }

    /// Events waiting in the intake queue.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }
}

impl PipelineTask {
    /// Stops intake and waits for the assembler's final flush.
    pub async fn shutdown(self) -> AssemblerStats {
        self.shutdown.cancel();
        match self.assembler.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "batch assembler task failed");
                AssemblerStats::default()
            }
        }
    }
}
