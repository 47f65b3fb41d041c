use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{config::DispatcherConfig, DispatchError, DispatchResult};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => CLOSED,
            Self::Open => OPEN,
            Self::HalfOpen => HALF_OPEN,
        }
    }
}

/// How [`CircuitBreaker::check`] admitted a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,

    /// Holds one half-open trial permit
    Trial,
}

/// Observable breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,

    /// When the open breaker lets trial dispatches through
    pub next_attempt_time: Option<DateTime<Utc>>,
}

/// Breaker thresholds
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub timeout: Duration,
    pub failure_window: Duration,
    pub half_open_max_calls: u32,
    pub half_open_success_threshold: u32,
}

impl BreakerSettings {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            threshold: config.circuit_breaker_threshold.max(1),
            timeout: config.circuit_breaker_timeout,
            failure_window: config.failure_window,
            half_open_max_calls: config.half_open_max_calls.max(1),
            half_open_success_threshold: config
                .half_open_success_threshold
                .clamp(1, config.half_open_max_calls.max(1)),
        }
    }
}

#[derive(Debug, Default)]
struct Timestamps {
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

/// Pool-wide circuit breaker
///
/// Requests read the state and bump counters without blocking; state
/// transitions happen only in [`CircuitBreaker::tick`].
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: AtomicU8,
    failures: AtomicU32,
    trial_permits: AtomicU32,
    trial_successes: AtomicU32,
    trial_failures: AtomicU32,
    times: Mutex<Timestamps>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            trial_permits: AtomicU32::new(0),
            trial_successes: AtomicU32::new(0),
            trial_failures: AtomicU32::new(0),
            times: Mutex::new(Timestamps::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn remaining_open(&self, now: Instant) -> Duration {
        self.times
            .lock()
            .opened_at
            .map(|opened| (opened + self.settings.timeout).saturating_duration_since(now))
            .unwrap_or(self.settings.timeout)
    }

    /// Admit or reject one dispatch
    ///
    /// Once failures reach the threshold, requests are rejected even before
    /// the next tick formally opens the breaker.
    ///
    /// A [`Admission::Trial`] that never reaches a member must be handed back
    /// with [`CircuitBreaker::release`].
    pub fn check(&self) -> DispatchResult<Admission> {
        match self.state() {
            CircuitState::Closed => {
                if self.failure_count() >= self.settings.threshold {
                    return Err(DispatchError::CircuitOpen {
                        retry_after_ms: self.settings.timeout.as_millis() as u64,
                    });
                }
                Ok(Admission::Normal)
            }
            CircuitState::Open => Err(DispatchError::CircuitOpen {
                retry_after_ms: self.remaining_open(Instant::now()).as_millis() as u64,
            }),
            CircuitState::HalfOpen => {
                let admitted = self
                    .trial_permits
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                    .is_ok();
                if admitted {
                    Ok(Admission::Trial)
                } else {
                    Err(DispatchError::CircuitOpen { retry_after_ms: 0 })
                }
            }
        }
    }

    /// Return an unused trial permit
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Trial && self.state() == CircuitState::HalfOpen {
            let max = self.settings.half_open_max_calls;
            let _ = self
                .trial_permits
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                    (left < max).then_some(left + 1)
                });
        }
    }

    pub fn record_success(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.trial_successes.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        {
            let mut times = self.times.lock();
            times.last_failure = Some(Instant::now());
            times.last_failure_wall = Some(Utc::now());
        }
        if self.state() == CircuitState::HalfOpen {
            self.trial_failures.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Apply due state transitions
    pub fn tick(&self) -> Option<(CircuitState, CircuitState)> {
        self.tick_at(Instant::now())
    }

    /// Apply state transitions as of `now`; returns `(from, to)` on change
    pub fn tick_at(&self, now: Instant) -> Option<(CircuitState, CircuitState)> {
        let from = self.state();
        let to = match from {
            CircuitState::Closed => {
                if self.failure_count() >= self.settings.threshold {
                    self.open(now);
                    CircuitState::Open
                } else {
                    let stale = self
                        .times
                        .lock()
                        .last_failure
                        .map_or(false, |last| now.saturating_duration_since(last) > self.settings.failure_window);
                    if stale {
                        self.failures.store(0, Ordering::Release);
                    }
                    CircuitState::Closed
                }
            }
            CircuitState::Open => {
                if self.remaining_open(now).is_zero() {
                    self.trial_successes.store(0, Ordering::Release);
                    self.trial_failures.store(0, Ordering::Release);
                    self.trial_permits
                        .store(self.settings.half_open_max_calls, Ordering::Release);
                    self.set_state(CircuitState::HalfOpen);
                    info!("Circuit breaker half-open, admitting trial dispatches");
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_failures.load(Ordering::Acquire) > 0 {
                    self.open(now);
                    CircuitState::Open
                } else if self.trial_successes.load(Ordering::Acquire)
                    >= self.settings.half_open_success_threshold
                {
                    self.failures.store(0, Ordering::Release);
                    self.trial_permits.store(0, Ordering::Release);
                    self.set_state(CircuitState::Closed);
                    info!("Circuit breaker closed");
                    CircuitState::Closed
                } else {
                    CircuitState::HalfOpen
                }
            }
        };

        (from != to).then_some((from, to))
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn open(&self, now: Instant) {
        self.times.lock().opened_at = Some(now);
        self.trial_permits.store(0, Ordering::Release);
        self.set_state(CircuitState::Open);
        warn!(
            failures = self.failure_count(),
            timeout = ?self.settings.timeout,
            "Circuit breaker opened"
        );
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let state = self.state();
        let next_attempt_time = match state {
            CircuitState::Open => chrono::Duration::from_std(self.remaining_open(Instant::now()))
                .ok()
                .map(|remaining| Utc::now() + remaining),
            _ => None,
        };

        CircuitBreakerState {
            is_open: state != CircuitState::Closed,
            state,
            failure_count: self.failure_count(),
            last_failure_time: self.times.lock().last_failure_wall,
            next_attempt_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            threshold: 3,
            timeout: Duration::from_secs(10),
            failure_window: Duration::from_secs(60),
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_ok!(cb.check());

        cb.record_failure();
        assert!(matches!(cb.check(), Err(DispatchError::CircuitOpen { .. })));
        assert_eq!(cb.tick(), Some((CircuitState::Closed, CircuitState::Open)));
        assert!(cb.snapshot().is_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_trial_successes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.tick();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cb.tick(), Some((CircuitState::Open, CircuitState::HalfOpen)));

        assert_ok!(cb.check());
        assert_ok!(cb.check());
        assert_err!(cb.check());

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.tick(), Some((CircuitState::HalfOpen, CircuitState::Closed)));
        assert_eq!(cb.failure_count(), 0);
        assert_ok!(cb.check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_permit_is_reusable() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.tick();
        tokio::time::advance(Duration::from_secs(10)).await;
        cb.tick();

        let first = assert_ok!(cb.check());
        let second = assert_ok!(cb.check());
        assert_eq!((first, second), (Admission::Trial, Admission::Trial));
        assert_err!(cb.check());

        cb.release(first);
        cb.release(second);
        cb.release(Admission::Trial);
        assert_ok!(cb.check());
        assert_ok!(cb.check());
        assert_err!(cb.check());

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.tick(), Some((CircuitState::HalfOpen, CircuitState::Closed)));
        assert_eq!(assert_ok!(cb.check()), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_trial_failure() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.tick();
        tokio::time::advance(Duration::from_secs(10)).await;
        cb.tick();

        assert_ok!(cb.check());
        cb.record_failure();
        assert_eq!(cb.tick(), Some((CircuitState::HalfOpen, CircuitState::Open)));
        assert!(matches!(
            cb.check(),
            Err(DispatchError::CircuitOpen { retry_after_ms }) if retry_after_ms == 10_000
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_expire_outside_window() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.tick(), None);
        assert_eq!(cb.failure_count(), 0);
    }
}
