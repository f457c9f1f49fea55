//! Retry policy engine for failed step attempts.
//!
//! Stateless: every decision is a pure function of the step's `RetrySpec`,
//! the 1-based attempt number, and the failure classification. Only
//! transient failures are retried; a permanent failure gives up immediately
//! no matter how much attempt budget remains.

use std::time::Duration;

use procflow_types::error::CapabilityError;
use procflow_types::workflow::{BackoffPolicy, RetrySpec};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on a computed backoff delay when the spec sets no
/// `max_delay_ms` (30 seconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// The action to take after a failed step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait out the backoff delay, then re-run the step with identical
    /// inputs.
    RetryAfter(Duration),
    /// The failure is final for this step.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryEngine
// ---------------------------------------------------------------------------

/// Stateless retry decision engine.
///
/// No internal state; all logic lives in associated functions that take the
/// retry configuration as parameters.
pub struct RetryEngine;

impl RetryEngine {
    /// Decide what to do after attempt `attempt` of a step failed.
    ///
    /// `attempt` is 1-based (the first execution is attempt 1). A step
    /// without a retry spec gets exactly one attempt. Permanent failures
    /// never retry.
    pub fn decide(
        spec: Option<&RetrySpec>,
        attempt: u32,
        error: &CapabilityError,
    ) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::GiveUp;
        }
        let Some(spec) = spec else {
            return RetryDecision::GiveUp;
        };
        if attempt >= spec.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(Self::backoff_delay(spec, attempt))
    }

    /// Delay to wait after attempt `attempt` before the next one.
    ///
    /// Fixed backoff always waits `delay_ms`. Exponential backoff doubles
    /// per attempt (`delay_ms * 2^(attempt - 1)`), capped by `max_delay_ms`
    /// or [`DEFAULT_MAX_DELAY_MS`] when the spec sets none.
    pub fn backoff_delay(spec: &RetrySpec, attempt: u32) -> Duration {
        let millis = match spec.backoff {
            BackoffPolicy::Fixed => spec.delay_ms,
            BackoffPolicy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(32);
                spec.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        let cap = spec.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS);
        Duration::from_millis(millis.min(cap))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_attempts: u32, delay_ms: u64, backoff: BackoffPolicy) -> RetrySpec {
        RetrySpec {
            max_attempts,
            delay_ms,
            backoff,
            max_delay_ms: None,
        }
    }

    fn transient() -> CapabilityError {
        CapabilityError::transient("connection reset")
    }

    // -------------------------------------------------------------------
    // decide
    // -------------------------------------------------------------------

    #[test]
    fn no_spec_gives_up_after_first_attempt() {
        let decision = RetryEngine::decide(None, 1, &transient());
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_failure_never_retries() {
        let config = spec(5, 100, BackoffPolicy::Fixed);
        let error = CapabilityError::permanent("unknown field 'foo'");
        assert_eq!(
            RetryEngine::decide(Some(&config), 1, &error),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn transient_failure_retries_within_budget() {
        let config = spec(3, 100, BackoffPolicy::Fixed);
        assert_eq!(
            RetryEngine::decide(Some(&config), 1, &transient()),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            RetryEngine::decide(Some(&config), 2, &transient()),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let config = spec(3, 100, BackoffPolicy::Fixed);
        assert_eq!(
            RetryEngine::decide(Some(&config), 3, &transient()),
            RetryDecision::GiveUp
        );
        assert_eq!(
            RetryEngine::decide(Some(&config), 4, &transient()),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn single_attempt_spec_never_retries() {
        let config = spec(1, 100, BackoffPolicy::Fixed);
        assert_eq!(
            RetryEngine::decide(Some(&config), 1, &transient()),
            RetryDecision::GiveUp
        );
    }

    // -------------------------------------------------------------------
    // backoff_delay
    // -------------------------------------------------------------------

    #[test]
    fn fixed_delay_is_constant() {
        let config = spec(5, 250, BackoffPolicy::Fixed);
        for attempt in 1..=4 {
            assert_eq!(
                RetryEngine::backoff_delay(&config, attempt),
                Duration::from_millis(250)
            );
        }
    }

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let config = spec(5, 100, BackoffPolicy::Exponential);
        assert_eq!(
            RetryEngine::backoff_delay(&config, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            RetryEngine::backoff_delay(&config, 2),
            Duration::from_millis(200)
        );
        assert_eq!(
            RetryEngine::backoff_delay(&config, 3),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn exponential_delay_respects_explicit_cap() {
        let config = RetrySpec {
            max_attempts: 10,
            delay_ms: 100,
            backoff: BackoffPolicy::Exponential,
            max_delay_ms: Some(500),
        };
        assert_eq!(
            RetryEngine::backoff_delay(&config, 4),
            Duration::from_millis(500)
        );
        assert_eq!(
            RetryEngine::backoff_delay(&config, 9),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn exponential_delay_defaults_to_thirty_second_cap() {
        let config = spec(20, 1000, BackoffPolicy::Exponential);
        assert_eq!(
            RetryEngine::backoff_delay(&config, 10),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS)
        );
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let config = spec(u32::MAX, u64::MAX / 2, BackoffPolicy::Exponential);
        let delay = RetryEngine::backoff_delay(&config, u32::MAX);
        assert_eq!(delay, Duration::from_millis(DEFAULT_MAX_DELAY_MS));
    }

    // -------------------------------------------------------------------
    // Serde defaults
    // -------------------------------------------------------------------

    #[test]
    fn default_spec_allows_three_attempts() {
        // Verify through YAML deserialization that the default is 3
        let config: RetrySpec = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_ms, 1000);
        assert_eq!(config.backoff, BackoffPolicy::Fixed);

        assert!(matches!(
            RetryEngine::decide(Some(&config), 1, &transient()),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            RetryEngine::decide(Some(&config), 2, &transient()),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            RetryEngine::decide(Some(&config), 3, &transient()),
            RetryDecision::GiveUp
        );
    }
}
