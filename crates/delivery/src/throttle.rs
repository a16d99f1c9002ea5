//! Outbound throttling — enforces the global send-rate cap shared by the
//! dispatch worker pool. Saturation means waiting, not rejection.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabletalk_core::config::DispatchConfig;

pub struct DispatchThrottle {
    max_per_second: u64,
    burst_allowance: u64,
    second_counter: AtomicU64,
    last_reset: parking_lot::Mutex<DateTime<Utc>>,
}

impl DispatchThrottle {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            max_per_second: config.max_per_second,
            burst_allowance: config.burst_allowance,
            second_counter: AtomicU64::new(0),
            last_reset: parking_lot::Mutex::new(Utc::now()),
        }
    }

    /// Takes one send slot if the current window has budget left.
    pub fn try_acquire(&self) -> bool {
        self.maybe_reset_counter();
        let taken = self.second_counter.fetch_add(1, Ordering::Relaxed);
        if taken >= self.max_per_second + self.burst_allowance {
            self.second_counter.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Waits until a send slot is available. Backpressure for the worker
    /// pool: a saturated budget delays jobs, it never fails them.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn current_rate_per_second(&self) -> u64 {
        self.second_counter.load(Ordering::Relaxed)
    }

    fn maybe_reset_counter(&self) {
        let now = Utc::now();
        let mut last = self.last_reset.lock();
        if (now - *last).num_milliseconds() >= 1_000 {
            self.second_counter.store(0, Ordering::Relaxed);
            *last = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max: u64, burst: u64) -> DispatchThrottle {
        DispatchThrottle::new(&DispatchConfig {
            max_per_second: max,
            burst_allowance: burst,
            ..DispatchConfig::default()
        })
    }

    #[test]
    fn test_budget_exhausts_within_window() {
        let throttle = throttle(2, 1);
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
        assert_eq!(throttle.current_rate_per_second(), 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_next_window() {
        let throttle = throttle(1, 0);
        throttle.acquire().await;
        let started = std::time::Instant::now();
        throttle.acquire().await;
        // The second slot only opens after the one-second window rolls.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
