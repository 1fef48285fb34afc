use std::time::Duration;

pub(crate) const DEFAULT_TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a cache instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target capacity in bytes, spread over 256 buckets and rounded up to
    /// whole 64 KiB chunks per bucket.
    pub max_bytes: usize,

    /// How often the background sweeper prunes expired TTL deadlines
    /// (default: 30s).
    pub ttl_sweep_interval: Duration,
}

impl Config {
    /// Create a new config with the given capacity.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ttl_sweep_interval: DEFAULT_TTL_SWEEP_INTERVAL,
        }
    }

    /// Set the TTL sweep interval.
    pub fn ttl_sweep_interval(mut self, interval: Duration) -> Self {
        self.ttl_sweep_interval = interval;
        self
    }
}
