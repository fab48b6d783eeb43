//! Per-client circuit breaker.
//!
//! ```text
//! Closed ──(consecutive failures >= threshold)──▶ Open
//! Open ──(reset time elapsed, next acquire)──▶ HalfOpen (one probe)
//! HalfOpen ──(probe succeeds)──▶ Closed
//! HalfOpen ──(probe fails)──▶ Open (cooldown restarts)
//! ```
//!
//! All state lives behind a single mutex; clones share it, so every call path of one client
//! sees the same breaker while separate clients never interfere. Accounting is explicit: the
//! caller obtains a [`Permit`] before sending and hands it back through
//! [`CircuitBreaker::record_success`] or [`CircuitBreaker::record_failure`]. Outcomes that say
//! nothing about backend health (auth, bad input, rate limiting) simply drop the permit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, RetryConfig};
use crate::error::ClassifiedError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Rejecting calls until the reset time elapses.
    Open,
    /// One probe is allowed through to test recovery.
    HalfOpen,
}

/// Point-in-time copy of the breaker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Clock reading when the breaker last opened; `None` while closed.
    pub opened_at_millis: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_millis: u64,
    probe_in_flight: bool,
}

/// Circuit breaker shared by all calls made through one client.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    threshold: u32,
    reset_time: Duration,
    clock: Arc<dyn Clock>,
}

/// Permission to send one attempt.
///
/// A probe permit that is dropped without being recorded releases the half-open slot, so a
/// cancelled or panicking probe doesn't wedge the breaker.
#[derive(Debug)]
#[must_use = "a permit must be recorded or dropped after the attempt"]
pub struct Permit {
    state: Arc<Mutex<BreakerState>>,
    probe: bool,
}

impl Permit {
    /// Whether this attempt is the half-open recovery probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.probe {
            let mut state = lock(&self.state);
            if state.state == CircuitState::HalfOpen {
                state.probe_in_flight = false;
            }
        }
    }
}

fn lock(state: &Mutex<BreakerState>) -> MutexGuard<'_, BreakerState> {
    // Critical sections never panic halfway through a transition.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreaker {
    /// Create a breaker; `threshold` must be >= 1. A zero `reset_time` lets a probe through on
    /// the very next call after opening.
    pub fn new(threshold: u32, reset_time: Duration) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold(threshold));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_millis: 0,
                probe_in_flight: false,
            })),
            threshold,
            reset_time,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Breaker using the threshold and reset time of a retry config.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        Self::new(config.circuit_breaker_threshold, config.circuit_breaker_reset_time)
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset_time(&self) -> Duration {
        self.reset_time
    }

    /// Ask to send one attempt.
    ///
    /// # Errors
    /// `ClassifiedError::CircuitBreaker` while open and cooling down, or while half-open with
    /// the probe already in flight.
    pub fn try_acquire(&self) -> Result<Permit, ClassifiedError> {
        let mut state = lock(&self.state);
        match state.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let elapsed = self.elapsed_since_open(&state);
                if elapsed >= self.reset_time {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!(
                        failures = state.consecutive_failures,
                        "Circuit breaker → half-open"
                    );
                    Ok(self.permit(true))
                } else {
                    Err(ClassifiedError::CircuitBreaker {
                        failures: state.consecutive_failures,
                        retry_in: self.reset_time - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(ClassifiedError::CircuitBreaker {
                        failures: state.consecutive_failures,
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.probe_in_flight = true;
                    tracing::debug!("Circuit breaker: half-open probe request");
                    Ok(self.permit(true))
                }
            }
        }
    }

    /// The attempt behind `permit` got a healthy response.
    ///
    /// Closed: the failure streak resets. HalfOpen probe: the breaker closes.
    pub fn record_success(&self, permit: Permit) {
        let mut state = lock(&self.state);
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen if permit.probe => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at_millis = 0;
                state.probe_in_flight = false;
                tracing::info!("Circuit breaker → closed");
            }
            // Late result of an attempt admitted before the breaker opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
        drop(state);
        drop(permit);
    }

    /// The attempt behind `permit` failed on the backend side (5xx or transport).
    pub fn record_failure(&self, permit: Permit) {
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.consecutive_failures;
        match state.state {
            CircuitState::Closed if failures >= self.threshold => {
                state.state = CircuitState::Open;
                state.opened_at_millis = now;
                tracing::error!(failures, threshold = self.threshold, "Circuit breaker → open");
            }
            CircuitState::HalfOpen if permit.probe => {
                state.state = CircuitState::Open;
                state.opened_at_millis = now;
                state.probe_in_flight = false;
                tracing::warn!(failures, "Circuit breaker: probe failed → open");
            }
            _ => {}
        }
        drop(state);
        drop(permit);
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.state).state
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.state).consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = lock(&self.state);
        BreakerSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            opened_at_millis: (state.state != CircuitState::Closed)
                .then_some(state.opened_at_millis),
        }
    }

    /// Force the breaker closed and clear the failure streak.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at_millis = 0;
        state.probe_in_flight = false;
    }

    fn permit(&self, probe: bool) -> Permit {
        Permit { state: Arc::clone(&self.state), probe }
    }

    fn elapsed_since_open(&self, state: &BreakerState) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(state.opened_at_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::future::join_all;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(threshold, Duration::from_millis(reset_ms))
            .expect("valid breaker")
            .with_clock(clock.clone());
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let permit = breaker.try_acquire().expect("closed breaker admits");
            breaker.record_failure(permit);
        }
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = CircuitBreaker::new(0, Duration::from_secs(1)).expect_err("zero is invalid");
        assert_eq!(err, ConfigError::InvalidBreakerThreshold(0));
    }

    #[test]
    fn starts_closed() {
        let (breaker, _) = breaker(3, 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let permit = breaker.try_acquire().unwrap();
        assert!(!permit.is_probe());
        breaker.record_success(permit);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _) = breaker(3, 10_000);
        fail(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.try_acquire() {
            Err(ClassifiedError::CircuitBreaker { failures, retry_in }) => {
                assert_eq!(failures, 3);
                assert_eq!(retry_in, Duration::from_secs(10));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_failure_streak() {
        let (breaker, _) = breaker(3, 1000);
        fail(&breaker, 2);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_success(permit);
        fail(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[test]
    fn dropped_permits_leave_counters_alone() {
        let (breaker, _) = breaker(2, 1000);
        fail(&breaker, 1);
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_reset_time_allows_exactly_one_probe() {
        let (breaker, clock) = breaker(1, 100);
        fail(&breaker, 1);

        clock.advance(99);
        assert!(breaker.try_acquire().is_err(), "still cooling down");

        clock.advance(1);
        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.try_acquire();
        assert!(matches!(
            second,
            Err(ClassifiedError::CircuitBreaker { retry_in: Duration::ZERO, .. })
        ));

        breaker.record_success(probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let (breaker, clock) = breaker(2, 100);
        fail(&breaker, 2);
        clock.advance(150);

        let probe = breaker.try_acquire().unwrap();
        breaker.record_failure(probe);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().opened_at_millis, Some(150));

        clock.advance(50);
        assert!(breaker.try_acquire().is_err(), "cooldown restarted at probe failure");
        clock.advance(50);
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn dropped_probe_frees_the_slot() {
        let (breaker, clock) = breaker(1, 10);
        fail(&breaker, 1);
        clock.advance(10);

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let next = breaker.try_acquire().expect("slot released");
        assert!(next.is_probe());
    }

    #[test]
    fn zero_reset_time_probes_immediately() {
        let (breaker, _) = breaker(1, 0);
        fail(&breaker, 1);
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn late_success_from_closed_era_does_not_close_half_open() {
        let (breaker, clock) = breaker(1, 10);
        let straggler = breaker.try_acquire().unwrap();
        fail(&breaker, 1);
        clock.advance(10);
        let probe = breaker.try_acquire().unwrap();

        breaker.record_success(straggler);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success(probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_forces_closed() {
        let (breaker, _) = breaker(1, 60_000);
        fail(&breaker, 1);
        breaker.reset();
        assert_eq!(
            breaker.snapshot(),
            BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_millis: None
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_are_not_lost() {
        let (breaker, _) = breaker(1_000, 60_000);
        let tasks = 200;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let b = breaker.clone();
                let g = barrier.clone();
                tokio::spawn(async move {
                    g.wait().await;
                    let permit = b.try_acquire().expect("closed");
                    b.record_failure(permit);
                })
            })
            .collect();
        for result in join_all(handles).await {
            result.expect("task panicked");
        }
        assert_eq!(breaker.consecutive_failures(), tasks as u32);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_half_open_admits_single_probe() {
        let (breaker, clock) = breaker(1, 5);
        fail(&breaker, 1);
        clock.advance(5);

        let tasks = 64;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let b = breaker.clone();
                let g = barrier.clone();
                tokio::spawn(async move {
                    g.wait().await;
                    b.try_acquire().ok().map(|p| {
                        // Keep the probe outstanding so no one else can start one.
                        std::mem::forget(p);
                    })
                })
            })
            .collect();
        let admitted =
            join_all(handles).await.into_iter().filter(|r| matches!(r, Ok(Some(())))).count();
        assert_eq!(admitted, 1);
    }
}
