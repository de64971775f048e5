//! Retry policy for failed deliveries.

use std::time::Duration;

use rand::Rng;

use crate::message::{ExceptionRecord, Message};

/// Backoff configuration for operations that raise.
///
/// Failed messages are republished with a full-jitter exponential delay:
/// the cap doubles per retry until `max_exponent`, then plateaus, and the
/// actual delay is drawn uniformly from `[0, cap]`.
///
/// # Backoff Calculation
///
/// `cap = (2^min(retries, max_exponent) - 1) * base_delay`
///
/// With defaults (base = 340ms, max_exponent = 10):
/// - Retry 1: up to 0.34s
/// - Retry 2: up to 1.02s
/// - Retry 5: up to 10.54s
/// - Retry 10 and later: up to 347.82s
///
/// There is no retry ceiling by default. Set `max_retries` to move messages
/// that keep failing to the dead letter store instead.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use razorbus::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert!(policy.max_retries.is_none());
/// assert_eq!(policy.max_delay_for_retry(1), Duration::from_millis(340));
///
/// let bounded = RetryPolicy {
///     max_retries: Some(25),
///     ..Default::default()
/// };
/// assert!(!bounded.exhausted(25));
/// assert!(bounded.exhausted(26));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Unit of the exponential cap. Default: 340 milliseconds.
    pub base_delay: Duration,

    /// Retry count after which the cap stops doubling. Default: 10.
    pub max_exponent: u32,

    /// Retries allowed before a message is dead-lettered.
    ///
    /// `None` (the default) retries until the command is cancelled.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(340),
            max_exponent: 10,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before the given retry.
    ///
    /// # Arguments
    ///
    /// * `retries` - The message's retry counter after the failure was recorded
    pub fn max_delay_for_retry(&self, retries: u32) -> Duration {
        let exponent = retries.min(self.max_exponent).min(31);
        let steps = (1u32 << exponent) - 1;
        self.base_delay.saturating_mul(steps)
    }

    /// Draw the delay before the given retry from the thread-local RNG.
    pub fn delay_for_retry(&self, retries: u32) -> Duration {
        self.delay_for_retry_with(retries, &mut rand::thread_rng())
    }

    /// Draw the delay before the given retry, uniformly in `[0, cap]`.
    pub fn delay_for_retry_with<R: Rng>(&self, retries: u32, rng: &mut R) -> Duration {
        let cap = self.max_delay_for_retry(retries);
        if cap.is_zero() {
            return Duration::ZERO;
        }
        cap.mul_f64(rng.gen_range(0.0..=1.0)).min(cap)
    }

    /// Returns `true` if a message with this many retries should be
    /// dead-lettered rather than republished.
    pub fn exhausted(&self, retries: u32) -> bool {
        self.max_retries.is_some_and(|max| retries > max)
    }
}

/// Record a failed attempt on a copy of the message.
///
/// Increments `retries` (absent counts as zero) and appends one exception
/// record. All other fields are carried over unchanged.
pub fn update_body_with_exception(body: &Message, exception: ExceptionRecord) -> Message {
    let mut updated = body.clone();
    updated.retries = Some(body.retry_count().saturating_add(1));
    updated.exceptions.push(exception);
    updated
}
