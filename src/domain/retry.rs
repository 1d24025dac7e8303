use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};

/// Exponents above this would push the next attempt past any useful horizon.
const MAX_EXPONENT: u32 = 30;

/// Maps a claim count to the earliest time the message may be claimed again.
pub trait RetryStrategy: Debug + Send + Sync {
    fn next_attempt_at(&self, try_count: i32, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// `now + 2^(try_count + 2)` seconds: 8s, 16s, 32s, ...
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialRetryStrategy;

impl RetryStrategy for ExponentialRetryStrategy {
    fn next_attempt_at(&self, try_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = (try_count.max(1) as u32 + 2).min(MAX_EXPONENT);
        let delay = Duration::seconds(1_i64 << exponent);

        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantRetryStrategy {
    interval: Duration,
}

impl ConstantRetryStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl RetryStrategy for ConstantRetryStrategy {
    fn next_attempt_at(&self, _try_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
