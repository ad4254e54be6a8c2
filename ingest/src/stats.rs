//! Read-only aggregate queries over stored events, served on `GET /metrics`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sinks::SinkError;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
pub const DEFAULT_WINDOW_SECONDS: i64 = SECONDS_PER_DAY;
pub const MAX_WINDOW_SECONDS: i64 = 90 * SECONDS_PER_DAY;

/// Inclusive `[from, to]` window in epoch seconds plus optional filters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsFilter {
    pub event_name: Option<String>,
    pub channel: Option<String>,
    pub from: i64,
    pub to: i64,
}

impl StatsFilter {
    /// Resolves the window: no bounds means the last day up to `now`, a
    /// single bound extends one day from it, and any window is capped to
    /// the most recent 90 days before `to`.
    pub fn new(
        event_name: Option<String>,
        channel: Option<String>,
        from: Option<i64>,
        to: Option<i64>,
        now: i64,
    ) -> Self {
        let (from, to) = match (from, to) {
            (None, None) => (now.saturating_sub(DEFAULT_WINDOW_SECONDS), now),
            (Some(from), None) => (from, now),
            (None, Some(to)) => (to.saturating_sub(DEFAULT_WINDOW_SECONDS), to),
            (Some(from), Some(to)) => (from, to),
        };
        let from = from.max(to.saturating_sub(MAX_WINDOW_SECONDS));

        Self {
            event_name: event_name.filter(|v| !v.trim().is_empty()),
            channel: channel.filter(|v| !v.trim().is_empty()),
            from,
            to,
        }
    }

    pub fn matches(&self, name: &str, channel: Option<&str>, timestamp: i64) -> bool {
        timestamp >= self.from
            && timestamp <= self.to
            && self.event_name.as_deref().map_or(true, |n| n == name)
            && self.channel.as_deref().map_or(true, |c| Some(c) == channel)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub count: i64,
    pub unique_users: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_start: i64,
    pub count: i64,
    pub unique_users: i64,
}

/// Start of the UTC day containing `timestamp`.
pub fn day_start(timestamp: i64) -> i64 {
    timestamp.saturating_sub(timestamp.rem_euclid(SECONDS_PER_DAY))
}

#[async_trait]
pub trait EventStats {
    async fn totals(&self, filter: &StatsFilter) -> Result<Totals, SinkError>;
    /// Per-day buckets ordered by `bucket_start` ascending.
    async fn daily_buckets(&self, filter: &StatsFilter) -> Result<Vec<Bucket>, SinkError>;
}
