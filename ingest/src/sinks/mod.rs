use async_trait::async_trait;
use thiserror::Error;

use crate::dedup::KeyedEvent;
use crate::stats::EventStats;

pub mod memory;
pub mod postgres;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("failed to encode event {key}: {error}")]
    Encode {
        key: String,
        error: serde_json::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Idempotent batch persistence.
///
/// Writing an event whose dedup key is already stored, in the same batch or a
/// previous one, is not an error and stores nothing. A failed write commits
/// nothing from that call.
#[async_trait]
pub trait BatchSink {
    /// Returns the number of events newly stored, which is lower than
    /// `batch.len()` when duplicates were skipped. An empty batch is a no-op.
    async fn write(&self, batch: &[KeyedEvent]) -> Result<u64, SinkError>;

    /// Whether the storage backend can currently accept writes.
    async fn ready(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Storage backends serve both the write path and the stats query path.
pub trait Storage: BatchSink + EventStats {}

impl<T: BatchSink + EventStats> Storage for T {}
