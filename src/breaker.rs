//! Circuit breaker guarding provider submissions.
//!
//! Per-chunk retry absorbs a flaky individual call; the breaker covers the
//! provider being down outright. Once enough consecutive submissions fail,
//! the circuit opens and the remaining chunks fail fast with a transient
//! error instead of each burning its full retry budget against a dead
//! endpoint. Recovery is probed on an exponentially widening schedule.

use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Consecutive submission failures before the circuit opens.
const OPEN_AFTER_FAILURES: u32 = 5;
/// Recovery probe schedule, widening from the first to the second bound.
const RECOVERY_DELAY_MIN: Duration = Duration::from_secs(10);
const RECOVERY_DELAY_MAX: Duration = Duration::from_secs(60);

/// Concrete breaker type so the engine can hold one in a field.
pub type ProviderBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Breaker configured with the submission policy above. One instance is
/// shared across all chunk tasks of an engine, so failures anywhere in a
/// run count toward the same circuit.
pub fn create_provider_circuit_breaker() -> ProviderBreaker {
    let recovery = backoff::exponential(RECOVERY_DELAY_MIN, RECOVERY_DELAY_MAX);
    Config::new()
        .failure_policy(failure_policy::consecutive_failures(
            OPEN_AFTER_FAILURES,
            recovery,
        ))
        .build()
}
