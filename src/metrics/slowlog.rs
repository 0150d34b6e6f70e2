use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Threshold value that turns the slowlog off.
pub const SLOWLOG_DISABLED: i64 = -1;

/// Flags client messages whose round trip took at least `threshold_us`
/// microseconds: one warn event and one `shardline_slowlog` count each.
#[derive(Debug)]
pub struct Slowlog {
    cluster: Arc<str>,
    threshold_us: i64,
}

impl Slowlog {
    pub fn new(cluster: Arc<str>, threshold_us: i64) -> Self {
        Self {
            cluster,
            threshold_us,
        }
    }

    pub fn disabled(cluster: Arc<str>) -> Self {
        Self::new(cluster, SLOWLOG_DISABLED)
    }

    /// `command` is only rendered for messages over the threshold.
    /// Returns whether the message was logged.
    pub fn maybe_record<F>(&self, duration: Duration, command: F) -> bool
    where
        F: FnOnce() -> String,
    {
        if self.threshold_us < 0 || duration.as_micros() < self.threshold_us as u128 {
            return false;
        }
        super::slowlog_incr(&self.cluster);
        warn!(
            cluster = %self.cluster,
            duration_us = duration.as_micros() as u64,
            command = %command(),
            "slow command"
        );
        true
    }
}
