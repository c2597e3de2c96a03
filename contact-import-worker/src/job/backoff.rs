use std::time::Duration;

/// Exponential backoff policy.
///
/// - initial_delay: base delay for attempt 0
/// - multiplier: factor by which delay grows each attempt (> 1.0)
/// - max_delay: cap for the computed delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delays between attempts at one batch write.
    pub const fn batch_retry() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let pow = self.multiplier.powi(exponent);
        let scaled = if pow.is_finite() {
            self.initial_delay.mul_f64(pow)
        } else {
            self.max_delay
        };
        scaled.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::batch_retry()
    }
}
