//! API call budget
//!
//! A token-bucket limiter for outgoing calls, independent of server-side
//! 429 responses. The client acquires one token before every physical
//! send and blocks until the bucket refills when exhausted. One budget
//! may be shared by all streams hitting the same policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Declarative budget parameters
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Sustained calls per second (0 disables the budget)
    pub calls_per_second: u64,
    /// Extra calls allowed above the sustained rate
    pub burst: u64,
}

impl BudgetConfig {
    /// Budget with a burst allowance of 10% (at least 1)
    pub fn new(calls_per_second: u64) -> Self {
        let burst = if calls_per_second == 0 {
            0
        } else {
            (calls_per_second / 10).max(1)
        };
        Self {
            calls_per_second,
            burst,
        }
    }

    /// No throttling
    pub fn unlimited() -> Self {
        Self {
            calls_per_second: 0,
            burst: 0,
        }
    }

    /// Whether the budget throttles at all
    pub fn is_enabled(&self) -> bool {
        self.calls_per_second > 0
    }
}

/// Token-bucket call budget
pub struct ApiBudget {
    tokens: AtomicU64,
    capacity: u64,
    refill_rate: u64,
    last_refill: Mutex<Instant>,
    config: BudgetConfig,
}

impl ApiBudget {
    /// Create a budget; the bucket starts full
    pub fn new(config: BudgetConfig) -> Self {
        let capacity = if config.is_enabled() {
            config.calls_per_second + config.burst
        } else {
            u64::MAX
        };
        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            refill_rate: config.calls_per_second,
            last_refill: Mutex::new(Instant::now()),
            config,
        }
    }

    /// Take one call token, sleeping until the bucket refills if empty
    pub async fn acquire(&self) {
        if !self.config.is_enabled() {
            return;
        }

        loop {
            self.refill().await;

            let current = self.tokens.load(Ordering::Acquire);
            if current >= 1
                && self
                    .tokens
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            if current >= 1 {
                // CAS raced with another caller
                continue;
            }

            let wait = Duration::from_secs_f64(1.0 / self.refill_rate as f64).min(
                Duration::from_secs(1),
            );
            debug!(?wait, "API budget exhausted, waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available
    pub fn remaining(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        let elapsed = last.elapsed();
        if elapsed.as_millis() < 1 {
            return;
        }
        let earned = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if earned > 0 {
            // Acquire decrements outside this mutex; a load/store pair
            // here would resurrect a token taken in between.
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_add(earned).min(self.capacity))
                });
            *last = Instant::now();
        }
    }
}
