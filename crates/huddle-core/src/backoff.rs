use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

impl BackoffConfig {
    /// Delay to wait before the given 1-based attempt.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// With jitter enabled the result is drawn uniformly from `[delay / 2, delay]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;
        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}
