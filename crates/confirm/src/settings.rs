use std::time::Duration;

use crate::Error;

/// Tuning for a [`crate::publisher::Publisher`].
#[derive(Clone, Debug)]
pub struct PublishSettings {
    /// Consecutive publish failures before publication is disabled.
    pub max_successive_failures: u32,
    /// Minimum time between stored-message retry probes.
    pub publish_retry_interval: Duration,
    /// Minimum time between in-memory buffer flushes.
    pub buffer_flush_interval: Duration,
    /// The background timer's poll interval.
    pub timer_tick: Duration,
    /// Page size for the recovery sweep through the backing store.
    pub sweep_page_size: usize,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            max_successive_failures: 5,
            publish_retry_interval: Duration::from_secs(30),
            buffer_flush_interval: Duration::from_secs(5),
            timer_tick: Duration::from_secs(1),
            sweep_page_size: 200,
        }
    }
}

impl PublishSettings {
    /// Validates the settings, aggregating every problem into one
    /// multi-line message so a misconfiguration is reported in full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] listing each violation.
    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();

        if self.max_successive_failures == 0 {
            problems.push("max_successive_failures must be at least 1".to_string());
        }
        if self.publish_retry_interval.is_zero() {
            problems.push("publish_retry_interval must be non-zero".to_string());
        }
        if self.buffer_flush_interval.is_zero() {
            problems.push("buffer_flush_interval must be non-zero".to_string());
        }
        if self.timer_tick.is_zero() {
            problems.push("timer_tick must be non-zero".to_string());
        }
        if self.sweep_page_size == 0 {
            problems.push("sweep_page_size must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidSettings(problems.join("\n")))
        }
    }
}
