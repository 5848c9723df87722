use std::time::Duration;
use thiserror::Error;

/// Dispatcher tunables.
///
/// The defaults are the production values; embedders override individual
/// fields and then validate once at construction.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on operations per atomic gateway submission.
    pub max_ops_per_batch: usize,

    /// Operations at or above this amount are split off and submitted alone,
    /// clamped to `hard_amount_limit - 1`.
    pub hard_amount_limit: u64,

    /// How many times a queue re-runs a failed batch before dropping it.
    pub max_item_retries: u32,

    /// How many times one in-flight slice is resubmitted after in-place
    /// corrections (trust line added, supply refilled) before being
    /// abandoned.
    pub max_op_retries: u32,

    /// Transient transport failures tolerated per in-flight slice.
    pub max_transient_retries: u32,

    /// Pause between queue items, clusters bursts of arrivals.
    pub idle_gap: Duration,

    /// Pause before a queue re-runs a failed batch.
    pub requeue_pause: Duration,

    /// Pause before resubmitting a slice whose failures were corrected in
    /// place.
    pub corrected_retry_pause: Duration,

    /// Base of the exponential transport back-off: attempt `n` sleeps
    /// `transient_backoff_base * 3^(n-1)`.
    pub transient_backoff_base: Duration,

    /// Re-poll interval while the sending kill switch is off.
    pub stop_sending_poll: Duration,

    /// How often the distributor fleet and issuer set are re-read.
    pub refresh_interval: Duration,

    /// Bounded depth of each distributor queue; admission blocks when full.
    pub queue_capacity: usize,

    /// Per-request gateway deadline. Exceeding it counts as a transient
    /// failure.
    pub gateway_timeout: Duration,

    /// How long shutdown waits for workers to finish their current batch.
    pub shutdown_deadline: Duration,

    /// Gas topped up per refill, in base units.
    pub gas_refill_amount: u64,

    /// Target distributor balance for issued-asset refills: a refill mints
    /// `supply_refill_limit - current_balance`.
    pub supply_refill_limit: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_ops_per_batch: 100,
            hard_amount_limit: 900_000_000_000,
            max_item_retries: 10,
            max_op_retries: 5,
            max_transient_retries: 3,
            idle_gap: Duration::from_millis(100),
            requeue_pause: Duration::from_secs(5),
            corrected_retry_pause: Duration::from_secs(1),
            transient_backoff_base: Duration::from_secs(3),
            stop_sending_poll: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
            queue_capacity: 1024,
            gateway_timeout: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(10),
            gas_refill_amount: 10,
            supply_refill_limit: 10_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid dispatcher config: {0}")]
pub struct ConfigError(pub &'static str);

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ops_per_batch == 0 {
            return Err(ConfigError("max_ops_per_batch must be > 0"));
        }
        if self.hard_amount_limit < 2 {
            // The split branch submits hard_amount_limit - 1.
            return Err(ConfigError("hard_amount_limit must be > 1"));
        }
        if self.max_item_retries == 0 {
            return Err(ConfigError("max_item_retries must be > 0"));
        }
        if self.max_op_retries == 0 {
            return Err(ConfigError("max_op_retries must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError("queue_capacity must be > 0"));
        }
        if self.gateway_timeout.is_zero() {
            return Err(ConfigError("gateway_timeout must be > 0"));
        }

        if self.gas_refill_amount == 0 {
            tracing::warn!("gas_refill_amount is 0; gas refills will be no-ops");
        }
        if self.supply_refill_limit == 0 {
            tracing::warn!("supply_refill_limit is 0; every asset refill will fail");
        }

        Ok(())
    }
}
