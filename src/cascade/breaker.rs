//! Latency circuit breaker guarding calls into a peer.
//!
//! Closed until a call is observed to be slower than the threshold, then
//! open for a cooldown. There is no timer: the open state is cleared lazily
//! by the first [`CircuitBreaker::allow`] after the cooldown has passed.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Calls slower than this open the breaker
    pub slow_threshold: Duration,
    /// How long the breaker stays open
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_secs(10),
            cooldown: Duration::from_secs(10),
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            open_until: Mutex::new(None),
        }
    }

    /// Whether a call may be attempted now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        match *open_until {
            None => true,
            Some(until) if now >= until => {
                *open_until = None;
                debug!(breaker = self.name, "Circuit breaker closed after cooldown");
                true
            }
            Some(_) => false,
        }
    }

    /// Feed an observed call latency. Returns true when this call opened
    /// the breaker.
    pub fn record(&self, latency: Duration) -> bool {
        self.record_at(latency, Instant::now())
    }

    fn record_at(&self, latency: Duration, now: Instant) -> bool {
        if latency <= self.config.slow_threshold {
            return false;
        }

        let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        *open_until = Some(now + self.config.cooldown);

        warn!(
            breaker = self.name,
            latency_ms = latency.as_millis() as u64,
            threshold_ms = self.config.slow_threshold.as_millis() as u64,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Slow upstream call, circuit breaker opened"
        );
        true
    }

    /// Read-only view of the state; does not clear an expired cooldown.
    pub fn is_open(&self) -> bool {
        let open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*open_until, Some(until) if Instant::now() < until)
    }

    /// Time left until the breaker may close, zero when closed.
    pub fn remaining_cooldown(&self) -> Duration {
        let open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}
