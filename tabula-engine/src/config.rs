use serde::{Deserialize, Serialize};

/// Global knobs that tune engine behaviour.
///
/// All fields carry defaults so deployments can adopt individual settings
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lease TTL, renewal cadence, and reclamation sweep interval.
    pub lease: LeaseConfig,
    /// Retry/backoff policy shared by all workers.
    pub retry: RetryConfig,
    /// Worker pool sizing and idle polling.
    pub pool: PoolConfig,
    /// Admission saturation thresholds.
    pub admission: AdmissionConfig,
}

/// Lease/heartbeat tuning for worker slots.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// TTL granted on claim and on each renewal (seconds).
    pub lease_ttl_secs: i64,
    /// Renew when this fraction of the TTL has elapsed (e.g. 1/3).
    pub renew_at_fraction: f32,
    /// Cadence of the background sweep that reclaims expired leases (ms).
    pub reclaim_interval_ms: u64,
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }

    /// Interval at which the owning worker renews its lease.
    pub fn renew_interval(&self) -> std::time::Duration {
        let ttl_ms = (self.lease_ttl_secs.max(1) as u64) * 1_000;
        let fraction = self.renew_at_fraction.clamp(0.05, 0.9);
        std::time::Duration::from_millis(((ttl_ms as f32) * fraction) as u64)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            renew_at_fraction: 1.0 / 3.0,
            reclaim_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default attempt budget for new runs.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Additive jitter as a fraction of the anchor delay.
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent execution slots.
    pub slots: usize,
    /// Sleep between claim attempts when no work is claimable (ms).
    pub idle_poll_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            idle_poll_ms: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Queue depth beyond which new submissions are rejected with
    /// backpressure rather than enqueued.
    pub max_queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
        }
    }
}
