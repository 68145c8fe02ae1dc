//! Retry classification and backoff.

use chrono::{DateTime, Duration, Utc};
use recur_core::{RetryPolicy, RetryStrategy};

/// Codes treated as transient when the job lists no match of its own.
pub const DEFAULT_RETRYABLE_CODES: [&str; 5] =
    ["TIMEOUT", "NETWORK", "RATE_LIMITED", "UNAVAILABLE", "IO_ERROR"];

const BASE_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt `attempt` at `at`.
    Retry { attempt: u32, at: DateTime<Utc>, delay_ms: u64 },
    /// Finalize as FAILED.
    GiveUp { retryable: bool },
}

/// `TIMEOUT` always retries; otherwise a code retries when the job lists it
/// or, failing that, when it is one of [`DEFAULT_RETRYABLE_CODES`].
pub fn is_retryable(policy: &RetryPolicy, code: &str) -> bool {
    let code = code.to_ascii_uppercase();
    code == "TIMEOUT"
        || policy.retryable_codes.iter().any(|c| *c == code)
        || DEFAULT_RETRYABLE_CODES.contains(&code.as_str())
}

/// Delay before the attempt following 0-based `attempt`.
pub fn retry_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    if policy.strategy == RetryStrategy::Immediate {
        return 0;
    }
    if let Some(last) = policy.delays.last() {
        return policy
            .delays
            .get(attempt as usize)
            .copied()
            .unwrap_or(*last);
    }
    match policy.strategy {
        RetryStrategy::Linear => BASE_DELAY_MS.saturating_mul(u64::from(attempt) + 1),
        _ => BASE_DELAY_MS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX)),
    }
}

pub fn decide(policy: &RetryPolicy, attempt: u32, code: &str, now: DateTime<Utc>) -> RetryDecision {
    let retryable = is_retryable(policy, code);
    if !retryable || attempt >= policy.max_retries {
        return RetryDecision::GiveUp { retryable };
    }
    let delay_ms = retry_delay_ms(policy, attempt);
    RetryDecision::Retry {
        attempt: attempt + 1,
        at: now
            .checked_add_signed(Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        delay_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy, delays: Vec<u64>) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy,
            delays,
            retryable_codes: vec![],
        }
    }

    #[test]
    fn listed_delays_clamp_to_the_last_entry() {
        let p = policy(RetryStrategy::Exponential, vec![1_000, 5_000, 30_000]);
        let delays: Vec<_> = (0..5).map(|a| retry_delay_ms(&p, a)).collect();
        assert_eq!(delays, vec![1_000, 5_000, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn immediate_ignores_delays() {
        let p = policy(RetryStrategy::Immediate, vec![1_000]);
        assert_eq!(retry_delay_ms(&p, 2), 0);
    }

    #[test]
    fn empty_delay_list_falls_back_to_the_strategy() {
        let lin = policy(RetryStrategy::Linear, vec![]);
        let exp = policy(RetryStrategy::Exponential, vec![]);
        assert_eq!((0..3).map(|a| retry_delay_ms(&lin, a)).collect::<Vec<_>>(), [1_000, 2_000, 3_000]);
        assert_eq!((0..3).map(|a| retry_delay_ms(&exp, a)).collect::<Vec<_>>(), [1_000, 2_000, 4_000]);
        assert_eq!(retry_delay_ms(&exp, 80), u64::MAX);
    }

    #[test]
    fn classification() {
        let mut p = policy(RetryStrategy::Exponential, vec![]);
        assert!(is_retryable(&p, "TIMEOUT"));
        assert!(is_retryable(&p, "network"));
        assert!(!is_retryable(&p, "INVALID_INPUT"));
        p.retryable_codes = vec!["INVALID_INPUT".into()];
        assert!(is_retryable(&p, "INVALID_INPUT"));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let p = policy(RetryStrategy::Exponential, vec![1_000, 5_000, 30_000]);
        let now = Utc::now();
        assert_eq!(
            decide(&p, 2, "TIMEOUT", now),
            RetryDecision::Retry {
                attempt: 3,
                at: now + Duration::milliseconds(30_000),
                delay_ms: 30_000
            }
        );
        assert_eq!(decide(&p, 3, "TIMEOUT", now), RetryDecision::GiveUp { retryable: true });
        assert_eq!(decide(&p, 0, "BAD", now), RetryDecision::GiveUp { retryable: false });
    }
}
