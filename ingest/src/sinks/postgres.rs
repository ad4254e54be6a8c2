use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::dedup::KeyedEvent;
use crate::event::non_empty;
use crate::sinks::{BatchSink, SinkError};
use crate::stats::{Bucket, EventStats, StatsFilter, Totals};

/// Column-major copy of a batch, bound as arrays and expanded with UNNEST so
/// a whole batch is one statement, and therefore one atomic write.
#[derive(Default)]
struct EventColumns {
    dedup_keys: Vec<String>,
    key_sources: Vec<String>,
    event_ids: Vec<Option<String>>,
    names: Vec<String>,
    user_ids: Vec<String>,
    timestamps: Vec<i64>,
    channels: Vec<Option<String>>,
    campaign_ids: Vec<Option<String>>,
    tags: Vec<Option<String>>,
    metadata: Vec<Option<String>>,
}

impl EventColumns {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            dedup_keys: Vec::with_capacity(capacity),
            key_sources: Vec::with_capacity(capacity),
            event_ids: Vec::with_capacity(capacity),
            names: Vec::with_capacity(capacity),
            user_ids: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            channels: Vec::with_capacity(capacity),
            campaign_ids: Vec::with_capacity(capacity),
            tags: Vec::with_capacity(capacity),
            metadata: Vec::with_capacity(capacity),
        }
    }

    fn append(&mut self, keyed: &KeyedEvent) -> Result<(), SinkError> {
        let KeyedEvent { key, event } = keyed;
        let encode = |error| SinkError::Encode {
            key: key.to_string(),
            error,
        };

        let tags = match event.tags.is_empty() {
            true => None,
            false => Some(serde_json::to_string(&event.tags).map_err(encode)?),
        };
        let metadata = match event.metadata.is_empty() {
            true => None,
            false => Some(serde_json::to_string(&event.metadata).map_err(encode)?),
        };

        self.dedup_keys.push(key.as_str().to_owned());
        self.key_sources.push(key.source().as_str().to_owned());
        self.event_ids.push(non_empty(&event.id).map(str::to_owned));
        self.names.push(event.name.clone());
        self.user_ids.push(event.user_id.clone());
        self.timestamps.push(event.timestamp);
        self.channels.push(non_empty(&event.channel).map(str::to_owned));
        self.campaign_ids
            .push(non_empty(&event.campaign_id).map(str::to_owned));
        self.tags.push(tags);
        self.metadata.push(metadata);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        info!("connecting to postgres...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!("connected to postgres");

        Ok(Self::new_from_pool(pool))
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations from `ingest/migrations`.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl BatchSink for PostgresSink {
    #[instrument(skip_all, fields(attempted = batch.len()))]
    async fn write(&self, batch: &[KeyedEvent]) -> Result<u64, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut columns = EventColumns::with_capacity(batch.len());
        for event in batch {
            columns.append(event)?;
        }

        let start = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO events (dedup_key, key_source, event_id, event_name, user_id, ts_epoch,
                                channel, campaign_id, tags, metadata)
            SELECT dedup_key, key_source, event_id, event_name, user_id, ts_epoch,
                   channel, campaign_id, tags::jsonb, metadata::jsonb
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::bigint[],
                        $7::text[], $8::text[], $9::text[], $10::text[])
                AS t(dedup_key, key_source, event_id, event_name, user_id, ts_epoch,
                     channel, campaign_id, tags, metadata)
            ON CONFLICT (dedup_key) DO NOTHING"#,
        )
        .bind(&columns.dedup_keys)
        .bind(&columns.key_sources)
        .bind(&columns.event_ids)
        .bind(&columns.names)
        .bind(&columns.user_ids)
        .bind(&columns.timestamps)
        .bind(&columns.channels)
        .bind(&columns.campaign_ids)
        .bind(&columns.tags)
        .bind(&columns.metadata)
        .execute(&self.pool)
        .await?;

        metrics::histogram!("ingest_postgres_write_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        Ok(result.rows_affected())
    }

    async fn ready(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStats for PostgresSink {
    async fn totals(&self, filter: &StatsFilter) -> Result<Totals, SinkError> {
        let (count, unique_users): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::bigint, COUNT(DISTINCT user_id)::bigint
            FROM events
            WHERE ts_epoch >= $1 AND ts_epoch <= $2
              AND ($3::text IS NULL OR event_name = $3)
              AND ($4::text IS NULL OR channel = $4)"#,
        )
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.event_name.as_deref())
        .bind(filter.channel.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(Totals {
            count,
            unique_users,
        })
    }

    async fn daily_buckets(&self, filter: &StatsFilter) -> Result<Vec<Bucket>, SinkError> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT (floor(ts_epoch / 86400.0) * 86400)::bigint AS bucket_start,
                   COUNT(*)::bigint,
                   COUNT(DISTINCT user_id)::bigint
            FROM events
            WHERE ts_epoch >= $1 AND ts_epoch <= $2
              AND ($3::text IS NULL OR event_name = $3)
              AND ($4::text IS NULL OR channel = $4)
            GROUP BY 1
            ORDER BY 1 ASC"#,
        )
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.event_name.as_deref())
        .bind(filter.channel.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket_start, count, unique_users)| Bucket {
                bucket_start,
                count,
                unique_users,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    fn keyed(id: Option<&str>, user_id: &str) -> KeyedEvent {
        Event {
            id: id.map(str::to_string),
            name: "purchase".to_string(),
            user_id: user_id.to_string(),
            timestamp: 1_750_000_000,
            channel: Some("web".to_string()),
            tags: vec!["vip".to_string()],
            metadata: [("amount".to_string(), json!(12.5))].into_iter().collect(),
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn columns_store_blank_optionals_as_null() {
        let mut event = keyed(Some(""), "u1");
        event.event.channel = Some(String::new());
        event.event.tags.clear();
        event.event.metadata.clear();

        let mut columns = EventColumns::default();
        columns.append(&event).unwrap();

        assert_eq!(columns.event_ids, vec![None]);
        assert_eq!(columns.channels, vec![None]);
        assert_eq!(columns.tags, vec![None]);
        assert_eq!(columns.metadata, vec![None]);
        assert_eq!(columns.key_sources, vec!["derived".to_string()]);
    }

    #[test]
    fn columns_encode_json_fields() {
        let mut columns = EventColumns::default();
        columns.append(&keyed(Some("evt-1"), "u1")).unwrap();

        assert_eq!(columns.dedup_keys, vec!["evt-1".to_string()]);
        assert_eq!(columns.tags, vec![Some(r#"["vip"]"#.to_string())]);
        assert_eq!(columns.metadata, vec![Some(r#"{"amount":12.5}"#.to_string())]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn rewriting_a_batch_inserts_nothing(db: PgPool) {
        let sink = PostgresSink::new_from_pool(db);
        let batch = vec![keyed(Some("evt-1"), "u1"), keyed(None, "u2")];

        assert_eq!(sink.write(&batch).await.unwrap(), 2);
        assert_eq!(sink.write(&batch).await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn duplicates_within_a_batch_insert_once(db: PgPool) {
        let sink = PostgresSink::new_from_pool(db);
        let event = keyed(None, "u1");

        assert_eq!(sink.write(&[event.clone(), event]).await.unwrap(), 1);
        assert_eq!(sink.write(&[]).await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn stats_over_stored_events(db: PgPool) {
        let sink = PostgresSink::new_from_pool(db);
        sink.write(&[keyed(None, "u1"), keyed(None, "u2"), keyed(Some("x"), "u1")])
            .await
            .unwrap();

        let filter = StatsFilter::new(
            Some("purchase".to_string()),
            Some("web".to_string()),
            None,
            None,
            1_750_000_100,
        );
        assert_eq!(
            sink.totals(&filter).await.unwrap(),
            Totals {
                count: 3,
                unique_users: 2
            }
        );
        let buckets = sink.daily_buckets(&filter).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 3);
    }
}
