//! Bounded retry with triangular backoff.
//!
//! Used by the delivery workers around transport calls and by the SQL backend
//! around connection-class failures.
use crate::time;
use std::fmt;
use std::time::Duration;

/// How many times to try and how long the backoff unit is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Multiplied by `k(k+1)/2` after failed attempt `k`.
    pub unit: Duration,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            max_attempts: 3,
            unit: Duration::from_secs(1),
        }
    }
}

impl Policy {
    /// A policy that makes exactly one attempt.
    pub fn once() -> Policy {
        Policy {
            max_attempts: 1,
            unit: Duration::from_secs(0),
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy's attempts are spent. `op` receives the 1-based attempt number.
///
/// ```
/// use std::time::Duration;
/// use metrika::retry::{with_backoff, Policy};
///
/// let policy = Policy { max_attempts: 3, unit: Duration::from_millis(1) };
/// let mut calls = 0;
/// let res: Result<u32, String> = with_backoff(&policy, |attempt| {
///     calls += 1;
///     if attempt < 2 { Err("refused".to_string()) } else { Ok(attempt) }
/// }, |_| true);
/// assert_eq!(res, Ok(2));
/// assert_eq!(calls, 2);
/// ```
pub fn with_backoff<T, E, F, R>(policy: &Policy, mut op: F, retryable: R) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(t) => return Ok(t),
            Err(e) => {
                if !retryable(&e) {
                    debug!("attempt {} failed, not retryable: {}", attempt, e);
                    return Err(e);
                }
                if attempt >= max {
                    warn!("giving up after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                info!("attempt {}/{} failed, retrying: {}", attempt, max, e);
                time::delay(attempt, policy.unit);
                attempt += 1;
            }
        }
    }
}
