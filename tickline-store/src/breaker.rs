//! Process-local circuit breaker guarding store writes.
//!
//! Lock-free: state, failure count and open timestamp are plain atomics so
//! the fail-fast path costs two loads. While open, one trial call per probe
//! interval is admitted; its outcome decides between half-open recovery and
//! staying open. Probe failures never leak to other callers, which keep
//! receiving the immediate circuit-open error.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the open state holds before one trial call is admitted.
    pub probe_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            probe_interval: Duration::from_secs(1),
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    /// Milliseconds since `epoch` at which the breaker last opened.
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Returns whether a call may proceed. In the open state at most one
    /// caller per probe interval wins the right to try.
    pub fn allow(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => {
                let now = self.now_ms();
                let opened = self.opened_at_ms.load(Ordering::SeqCst);
                if now.saturating_sub(opened) < self.config.probe_interval.as_millis() as u64 {
                    return false;
                }
                // Winning the CAS claims the probe slot and pushes the next
                // probe a full interval out.
                self.opened_at_ms
                    .compare_exchange(opened, now, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
            _ => true,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = self.state.compare_exchange(
                STATE_HALF_OPEN,
                STATE_CLOSED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_HALF_OPEN {
            self.reopen();
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if state == STATE_CLOSED && failures >= self.config.failure_threshold {
            self.reopen();
            warn!(failures, "circuit breaker opened");
        }
    }

    fn reopen(&self) {
        self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);
        self.state.store(STATE_OPEN, Ordering::SeqCst);
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
