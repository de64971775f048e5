//! Runtime configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for the dispatch runtime.
///
/// Controls polling, leases, shutdown, retry behavior, and worker concurrency.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use razorbus::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     poll_interval: Duration::from_millis(50),
///     lock_duration: Duration::from_secs(900), // image unpacks can be slow
///     workers: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often an idle worker polls the queue.
    ///
    /// Lower values reduce latency but increase store load.
    /// Default: 100ms.
    pub poll_interval: Duration,

    /// How long to hold the lease on a delivery while processing.
    ///
    /// Should be longer than the longest expected operation. If a worker
    /// crashes, or processing fails on a store error, the delivery becomes
    /// claimable again after this duration.
    /// Default: 5 minutes.
    pub lock_duration: Duration,

    /// Maximum time to wait for in-flight deliveries during shutdown.
    ///
    /// After this timeout, the runtime will force stop.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Backoff for failed operations, and the optional dead-letter ceiling.
    pub retry_policy: RetryPolicy,

    /// Worker identifier for distributed coordination.
    ///
    /// Used in the `locked_by` field to identify which worker holds a lease.
    /// If `None`, a UUID is generated when the bus is built.
    pub worker_id: Option<String>,

    /// Number of dispatch workers to spawn.
    ///
    /// Workers claim deliveries independently; the queue's leases keep two
    /// workers from processing the same delivery at once. Default: 1.
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            lock_duration: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            worker_id: None,
            workers: 1,
        }
    }
}
