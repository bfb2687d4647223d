//! Lock-free circuit breaker.
//!
//! State lives in atomics so concurrent callers never block each other.
//! Racing `check_at`/`record_failure_at` calls may overshoot the failure
//! threshold by a few counts but always leave one of the three states.
//! Cool-down expiry is evaluated lazily on the next check.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cooldown: DEFAULT_COOLDOWN }
    }
}

/// A call refused without touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    pub state: CircuitState,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    // Milliseconds since `epoch` of the last failure, or of the last
    // half-open grant while a trial is in flight.
    last_transition_ms: AtomicU64,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                cooldown: config.cooldown,
            },
            epoch: Instant::now(),
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            last_transition_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Admits or rejects a call at `now`.
    ///
    /// While open, the first caller after the cool-down wins the single
    /// half-open trial; everyone else keeps failing fast until that trial
    /// reports back.
    ///
    /// # Errors
    /// Returns [`BreakerRejection`] when the call must not be attempted.
    pub fn check_at(&self, now: Instant) -> Result<(), BreakerRejection> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(()),
            OPEN => {
                let remaining = self.cooldown_remaining_ms(now);
                if remaining > 0 {
                    return Err(BreakerRejection {
                        state: CircuitState::Open,
                        retry_after_ms: remaining,
                    });
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.last_transition_ms.store(self.millis_since_epoch(now), Ordering::Release);
                    tracing::info!(
                        consecutive_failures = self.consecutive_failures(),
                        "circuit breaker half-open; admitting trial call"
                    );
                    Ok(())
                } else {
                    Err(BreakerRejection { state: self.state(), retry_after_ms: 0 })
                }
            }
            _ => self.regrant_stalled_trial(now),
        }
    }

    /// A trial that never reported back would pin the breaker half-open;
    /// after another full cool-down a new trial is granted.
    fn regrant_stalled_trial(&self, now: Instant) -> Result<(), BreakerRejection> {
        let granted_at = self.last_transition_ms.load(Ordering::Acquire);
        let now_ms = self.millis_since_epoch(now);
        let cooldown_ms = duration_ms(self.config.cooldown);
        if now_ms.saturating_sub(granted_at) >= cooldown_ms
            && self
                .last_transition_ms
                .compare_exchange(granted_at, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Ok(());
        }
        Err(BreakerRejection { state: CircuitState::HalfOpen, retry_after_ms: 0 })
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous != CLOSED {
            tracing::info!(
                from = CircuitState::from_raw(previous).as_str(),
                "circuit breaker closed"
            );
        }
    }

    pub fn record_failure_at(&self, now: Instant) {
        self.last_transition_ms.store(self.millis_since_epoch(now), Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        if self
            .state
            .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(
                consecutive_failures = failures,
                "half-open trial failed; circuit breaker re-opened"
            );
            return;
        }

        if failures >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::warn!(
                consecutive_failures = failures,
                cooldown_ms = duration_ms(self.config.cooldown),
                "circuit breaker opened"
            );
        }
    }

    #[must_use]
    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let state = self.state();
        BreakerSnapshot {
            state,
            consecutive_failures: self.consecutive_failures(),
            cooldown_remaining_ms: if state == CircuitState::Open {
                self.cooldown_remaining_ms(now)
            } else {
                0
            },
        }
    }

    /// # Errors
    /// See [`CircuitBreaker::check_at`].
    pub fn check(&self) -> Result<(), BreakerRejection> {
        self.check_at(Instant::now())
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn cooldown_remaining_ms(&self, now: Instant) -> u64 {
        let last = self.last_transition_ms.load(Ordering::Acquire);
        let elapsed = self.millis_since_epoch(now).saturating_sub(last);
        duration_ms(self.config.cooldown).saturating_sub(elapsed)
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        duration_ms(now.saturating_duration_since(self.epoch))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn duration_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}
