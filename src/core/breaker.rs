//! Circuit breaker guarding one route's downstream calls.
//!
//! Classic three-state machine: `Closed` counts consecutive-ish failures (one
//! success pays off one failure), `Open` rejects everything until a recovery
//! timeout elapses, `HalfOpen` lets a bounded number of probe calls through
//! and closes again only after enough of them succeed.
use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Tuning knobs for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Failure count in `Closed` that trips the breaker
    pub failure_threshold: u32,
    /// How long `Open` rejects before probing is allowed
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// Probe budget in `HalfOpen`; also the successes required to close
    pub half_open_max_calls: u32,
}

/// Serialize/deserialize `recovery_timeout` as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Observable breaker state. Exposed for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; tracks the decaying failure count
    Closed { failures: u32 },
    /// Rejecting calls since `last_failure`
    Open { last_failure: Instant },
    /// Probing: `permitted` calls let through, `successes` recorded so far
    HalfOpen { permitted: u32, successes: u32 },
}

impl BreakerState {
    /// Short label used in logs and the status endpoint.
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Per-route circuit breaker.
///
/// All transitions happen under one mutex; the critical sections are a few
/// comparisons, so contention is not a concern at route granularity.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    policy: BreakerPolicy,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            policy,
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Current state snapshot.
    pub fn state(&self) -> BreakerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// May a call proceed right now? An affirmative answer in `HalfOpen`
    /// consumes one probe permit.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { last_failure } => {
                if now.duration_since(last_failure) > self.policy.recovery_timeout {
                    tracing::info!("Circuit breaker half-open, probing downstream");
                    *state = BreakerState::HalfOpen {
                        permitted: 1,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen {
                ref mut permitted, ..
            } => {
                if *permitted < self.policy.half_open_max_calls {
                    *permitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful downstream call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            BreakerState::Closed { ref mut failures } => {
                // A success pays off one accumulated failure.
                *failures = failures.saturating_sub(1);
            }
            BreakerState::HalfOpen {
                permitted,
                successes,
            } => {
                let successes = successes + 1;
                if successes >= self.policy.half_open_max_calls {
                    tracing::info!("Circuit breaker closed after successful probes");
                    *state = BreakerState::Closed { failures: 0 };
                } else {
                    *state = BreakerState::HalfOpen {
                        permitted,
                        successes,
                    };
                }
            }
            // A straggler success while open carries no signal.
            BreakerState::Open { .. } => {}
        }
    }

    /// Record a failed downstream call.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.policy.failure_threshold {
                    tracing::warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        failures
                    );
                    *state = BreakerState::Open { last_failure: now };
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen { .. } => {
                tracing::warn!("Circuit breaker re-opened: probe call failed");
                *state = BreakerState::Open { last_failure: now };
            }
            BreakerState::Open {
                ref mut last_failure,
            } => {
                *last_failure = now;
            }
        }
    }
}
