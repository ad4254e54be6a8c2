use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use crate::dedup::KeyedEvent;
use crate::sinks::{BatchSink, SinkError};
use crate::stats::{day_start, Bucket, EventStats, StatsFilter, Totals};

#[derive(Default)]
struct Stored {
    keys: HashSet<String>,
    events: Vec<KeyedEvent>,
}

/// In-process storage with the same idempotency contract as the database.
/// Only meant for local debugging and tests: contents are lost on exit.
#[derive(Clone, Default)]
pub struct MemorySink {
    stored: Arc<Mutex<Stored>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Stored>, SinkError> {
        self.stored
            .lock()
            .map_err(|_| SinkError::Unavailable("poisoned memory sink lock".to_string()))
    }

    /// Stored events in insertion order.
    pub fn events(&self) -> Vec<KeyedEvent> {
        self.lock().map(|s| s.events.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.events.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn write(&self, batch: &[KeyedEvent]) -> Result<u64, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut stored = self.lock()?;
        let mut inserted = 0;
        for event in batch {
            if stored.keys.insert(event.key.as_str().to_owned()) {
                stored.events.push(event.clone());
                inserted += 1;
            }
        }

        info!(inserted, attempted = batch.len(), "memory sink write");
        Ok(inserted)
    }
}

#[async_trait]
impl EventStats for MemorySink {
    async fn totals(&self, filter: &StatsFilter) -> Result<Totals, SinkError> {
        let stored = self.lock()?;
        let mut users = HashSet::new();
        let mut count = 0;
        for KeyedEvent { event, .. } in stored.events.iter() {
            if filter.matches(&event.name, event.channel.as_deref(), event.timestamp) {
                count += 1;
                users.insert(event.user_id.as_str());
            }
        }

        Ok(Totals {
            count,
            unique_users: users.len() as i64,
        })
    }

    async fn daily_buckets(&self, filter: &StatsFilter) -> Result<Vec<Bucket>, SinkError> {
        let stored = self.lock()?;
        let mut days: HashMap<i64, (i64, HashSet<&str>)> = HashMap::new();
        for KeyedEvent { event, .. } in stored.events.iter() {
            if filter.matches(&event.name, event.channel.as_deref(), event.timestamp) {
                let (count, users) = days.entry(day_start(event.timestamp)).or_default();
                *count += 1;
                users.insert(event.user_id.as_str());
            }
        }

        let mut buckets: Vec<Bucket> = days
            .into_iter()
            .map(|(bucket_start, (count, users))| Bucket {
                bucket_start,
                count,
                unique_users: users.len() as i64,
            })
            .collect();
        buckets.sort_by_key(|b| b.bucket_start);
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::stats::SECONDS_PER_DAY;

    const DAY: i64 = 20_000 * SECONDS_PER_DAY;

    fn keyed(name: &str, user_id: &str, timestamp: i64) -> KeyedEvent {
        Event {
            name: name.to_string(),
            user_id: user_id.to_string(),
            timestamp,
            ..Default::default()
        }
        .into()
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let sink = MemorySink::new();
        assert_eq!(sink.write(&[]).await.unwrap(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn rewriting_a_batch_stores_nothing_new() {
        let sink = MemorySink::new();
        let batch = vec![keyed("a", "u1", DAY), keyed("b", "u1", DAY)];

        assert_eq!(sink.write(&batch).await.unwrap(), 2);
        assert_eq!(sink.write(&batch).await.unwrap(), 0);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_are_stored_once() {
        let sink = MemorySink::new();
        let event = keyed("a", "u1", DAY);

        assert_eq!(sink.write(&[event.clone(), event]).await.unwrap(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn stats_group_by_day() {
        let sink = MemorySink::new();
        sink.write(&[
            keyed("a", "u1", DAY + 10),
            keyed("a", "u2", DAY + 20),
            keyed("a", "u1", DAY + 30),
            keyed("b", "u1", DAY + 40),
            keyed("a", "u3", DAY + SECONDS_PER_DAY + 1),
        ])
        .await
        .unwrap();

        let filter = StatsFilter::new(
            Some("a".to_string()),
            None,
            Some(DAY),
            Some(DAY + 2 * SECONDS_PER_DAY),
            0,
        );
        assert_eq!(
            sink.totals(&filter).await.unwrap(),
            Totals {
                count: 4,
                unique_users: 3
            }
        );
        assert_eq!(
            sink.daily_buckets(&filter).await.unwrap(),
            vec![
                Bucket {
                    bucket_start: DAY,
                    count: 3,
                    unique_users: 2
                },
                Bucket {
                    bucket_start: DAY + SECONDS_PER_DAY,
                    count: 1,
                    unique_users: 1
                },
            ]
        );
    }
}
