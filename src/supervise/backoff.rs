use std::time::Duration;

/// Restart backoff policy.
///
/// The delay before restart attempt `n` (1-based) is
/// `base * multiplier^(n - 1)`. There is no jitter and no ceiling; the
/// sequence of delays is part of the observable contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Initial delay in seconds before the first restart
    pub base_secs: f64,
    /// Multiplicative growth factor applied per attempt
    pub multiplier: f64,
}

impl RestartPolicy {
    pub fn new(base_secs: f64, multiplier: f64) -> Self {
        Self {
            base_secs,
            multiplier,
        }
    }

    /// Calculate the delay for a given restart attempt (first attempt is 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_secs * self.multiplier.powi(exponent);

        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        }
    }
}
