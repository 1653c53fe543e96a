//! Processor configuration.

use std::time::Duration;

/// Configuration of a [`ViewProcessor`](crate::ViewProcessor).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ViewProcessorConfig {
    // === Job execution ===
    /// Threads of the local job invoker. Zero disables the local invoker, leaving only
    /// invokers added explicitly.
    pub local_worker_threads: usize,

    /// Maximum number of nodes batched into one job.
    pub max_job_items: usize,

    /// A job not answered within this time fails its nodes (None = wait forever).
    pub job_timeout: Option<Duration>,

    /// How often the dispatcher wakes to check cancellation and timeouts.
    pub result_poll_interval: Duration,

    // === Market data ===
    /// Upper bound on waiting for market data when a process awaits it.
    pub market_data_timeout: Duration,

    // === Deltas ===
    /// Decimal places numeric values are compared at when computing deltas
    /// (None = exact comparison).
    pub delta_decimal_places: Option<i32>,
}

impl Default for ViewProcessorConfig {
    fn default() -> Self {
        Self {
            local_worker_threads: std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(4),
            max_job_items: 64,
            job_timeout: None,
            result_poll_interval: Duration::from_millis(50),
            market_data_timeout: Duration::from_secs(10),
            delta_decimal_places: None,
        }
    }
}

impl ViewProcessorConfig {
    /// Small configuration for tests: two local threads, short timeouts.
    pub fn minimal() -> Self {
        Self {
            local_worker_threads: 2,
            result_poll_interval: Duration::from_millis(10),
            market_data_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    // === Builder methods ===

    /// Set the number of local worker threads.
    pub fn with_local_worker_threads(mut self, threads: usize) -> Self {
        self.local_worker_threads = threads;
        self
    }

    /// Set the maximum number of nodes per job.
    pub fn with_max_job_items(mut self, items: usize) -> Self {
        self.max_job_items = items;
        self
    }

    /// Set the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set the dispatcher poll interval.
    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }

    /// Set the market-data await timeout.
    pub fn with_market_data_timeout(mut self, timeout: Duration) -> Self {
        self.market_data_timeout = timeout;
        self
    }

    /// Compare numbers at this many decimal places when computing deltas.
    pub fn with_delta_decimal_places(mut self, decimal_places: i32) -> Self {
        self.delta_decimal_places = Some(decimal_places);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_methods() {
        let config = ViewProcessorConfig::minimal()
            .with_local_worker_threads(1)
            .with_max_job_items(8)
            .with_job_timeout(Duration::from_secs(1))
            .with_delta_decimal_places(4);
        assert_eq!(config.local_worker_threads, 1);
        assert_eq!(config.max_job_items, 8);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.delta_decimal_places, Some(4));
        assert_eq!(config.result_poll_interval, Duration::from_millis(10));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ViewProcessorConfig =
            serde_json::from_str(r#"{ "max_job_items": 3 }"#).unwrap();
        assert_eq!(config.max_job_items, 3);
        assert_eq!(config.market_data_timeout, Duration::from_secs(10));
    }
}
