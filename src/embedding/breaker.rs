//! Per-provider circuit breaker
//!
//! Opens after N consecutive failures within a rolling window and stays
//! open for a cooldown. Counters are updated on success and on every
//! error or timeout path.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::types::CircuitBreakerConfig;

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    window_started_at: Option<Instant>,
    open_until: Option<Instant>,
}

/// Circuit breaker guarding one embedding or completion provider
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                window_started_at: None,
                open_until: None,
            }),
        }
    }

    /// True iff a call may proceed
    pub fn allows(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(open_until) = state.open_until {
            if Instant::now() < open_until {
                return false;
            }
            // Cooldown over: half-open, allow one attempt
            state.open_until = None;
            state.consecutive_failures = 0;
            state.window_started_at = None;
        }
        true
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.window_started_at = None;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_seconds);

        match state.window_started_at {
            Some(start) if now.duration_since(start) <= window => {
                state.consecutive_failures += 1;
            }
            _ => {
                state.window_started_at = Some(now);
                state.consecutive_failures = 1;
            }
        }

        if state.consecutive_failures >= self.config.failure_threshold {
            state.open_until = Some(now + Duration::from_secs(self.config.cooldown_seconds));
        }
    }

    /// True iff the breaker is currently open
    pub fn is_open(&self) -> bool {
        !self.allows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window_seconds: 60,
            cooldown_seconds: cooldown,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 60);
        assert!(b.allows());
        b.record_failure();
        b.record_failure();
        assert!(b.allows());
        b.record_failure();
        assert!(!b.allows());
    }

    #[test]
    fn test_success_resets() {
        let b = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert!(b.allows());
    }

    #[test]
    fn test_cooldown_allows_half_open_retry() {
        let b = breaker(1, 0);
        b.record_failure();
        // Zero cooldown: next check transitions to half-open
        assert!(b.allows());
    }
}
