pub trait TimeSource {
    /// Current time as epoch seconds, UTC
    fn current_time(&self) -> i64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }
}

/// Frozen clock, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub time: i64,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> i64 {
        self.time
    }
}
