use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dedup::KeyedEvent;
use crate::sinks::BatchSink;

/// Totals over the lifetime of an assembler, returned when it exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Non-empty batches handed to the sink
    pub flushes: u64,
    pub attempted: u64,
    pub inserted: u64,
    /// Events lost to failed writes
    pub dropped: u64,
}

/// Single consumer of the intake queue.
///
/// Wakes on whichever comes first of: shutdown, the flush timer, or a new
/// event. Every flush re-arms the timer for a full `max_wait`, so the wait is
/// relative to the previous flush. On shutdown the queue is closed, whatever
/// it still holds is appended to the batch, and one last flush runs before
/// the loop returns.
pub struct BatchAssembler {
    receiver: Receiver<KeyedEvent>,
    sink: Arc<dyn BatchSink + Send + Sync>,
    max_size: usize,
    max_wait: Duration,
    shutdown: CancellationToken,
    liveness: HealthHandle,
    batch: Vec<KeyedEvent>,
    stats: AssemblerStats,
}

impl BatchAssembler {
    pub fn new(
        receiver: Receiver<KeyedEvent>,
        sink: Arc<dyn BatchSink + Send + Sync>,
        max_size: usize,
        max_wait: Duration,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Self {
        let max_size = max_size.max(1);
        Self {
            receiver,
            sink,
            max_size,
            max_wait,
            shutdown,
            liveness,
            batch: Vec::with_capacity(max_size),
            stats: AssemblerStats::default(),
        }
    }

    pub async fn run(mut self) -> AssemblerStats {
        let timer = sleep(self.max_wait);
        tokio::pin!(timer);

        loop {
            self.liveness.report_healthy();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    // Yields None only once every in-flight send has landed
                    self.receiver.close();
                    while let Some(event) = self.receiver.recv().await {
                        self.batch.push(event);
                    }
                    info!(buffered = self.batch.len(), "shutting down, flushing buffered events");
                    self.flush().await;
                    break;
                }

                _ = &mut timer => {
                    self.flush().await;
                    timer.as_mut().reset(Instant::now() + self.max_wait);
                }

                received = self.receiver.recv() => match received {
                    Some(event) => {
                        self.batch.push(event);
                        if self.batch.len() >= self.max_size {
                            self.flush().await;
                            timer.as_mut().reset(Instant::now() + self.max_wait);
                        }
                    }
                    None => {
                        // Every producer is gone, nothing more can arrive
                        info!("intake queue closed, flushing buffered events");
                        self.flush().await;
                        break;
                    }
                },
            }
        }

        info!(
            flushes = self.stats.flushes,
            inserted = self.stats.inserted,
            dropped = self.stats.dropped,
            "batch assembler stopped"
        );
        self.stats
    }

    /// Writes the buffered batch and clears it whatever the outcome.
    /// Failed batches are not retried.
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let attempted = self.batch.len() as u64;
        histogram!("ingest_batch_size").record(attempted as f64);
        let start = Instant::now();

        match self.sink.write(&self.batch).await {
            Ok(inserted) => {
                info!(inserted, attempted, "batch flushed");
                counter!("ingest_flush_total", "outcome" => "ok").increment(1);
                counter!("ingest_events_inserted_total").increment(inserted);
                counter!("ingest_events_duplicate_total")
                    .increment(attempted.saturating_sub(inserted));
                self.stats.inserted += inserted;
            }
            Err(err) => {
                error!(error = %err, dropped = attempted, "batch flush failed, dropping batch");
                counter!("ingest_flush_total", "outcome" => "error").increment(1);
                counter!("ingest_events_dropped_total", "cause" => "flush_failed")
                    .increment(attempted);
                self.stats.dropped += attempted;
            }
        }

        histogram!("ingest_flush_duration_seconds").record(start.elapsed().as_secs_f64());
        self.stats.flushes += 1;
        self.stats.attempted += attempted;
        self.batch.clear();
        debug!(capacity = self.batch.capacity(), "batch buffer reset");
    }
}
