use std::time::Duration;

/// Backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed { delay_ms: u64 },
    Linear { base_delay_ms: u64 },
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl RetryPolicy {
    /// Delay to wait after the `failed`-th failed attempt (1-based).
    pub fn delay(&self, failed: usize) -> Duration {
        let failed = failed.max(1) as u64;
        match self {
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryPolicy::Linear { base_delay_ms } => {
                Duration::from_millis(base_delay_ms.saturating_mul(failed))
            }
            RetryPolicy::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                let factor = 2u64.saturating_pow((failed - 1) as u32);
                let delay = base_delay_ms.saturating_mul(factor);
                Duration::from_millis(delay.min(*max_delay_ms))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Linear {
            base_delay_ms: 5000,
        }
    }
}
