//! Time helpers: backoff delays, elapsed timing and interval parsing.
use std::thread;
use std::time::{Duration, Instant};

/// Nanoseconds elapsed since `i`, saturating.
pub fn elapsed_ns(i: Instant) -> u64 {
    let elapsed = i.elapsed();
    (elapsed.as_secs().saturating_mul(1_000_000_000)).saturating_add(u64::from(elapsed.subsec_nanos()))
}

/// The wait after failed attempt `attempt` (1-based): `attempt(attempt+1)/2`
/// units, so 1, 3, 6, 10 ... units.
///
/// ```
/// use std::time::Duration;
/// use metrika::time::backoff;
///
/// assert_eq!(backoff(1, Duration::from_secs(1)), Duration::from_secs(1));
/// assert_eq!(backoff(3, Duration::from_secs(1)), Duration::from_secs(6));
/// ```
#[inline]
pub fn backoff(attempt: u32, unit: Duration) -> Duration {
    let steps = attempt.saturating_mul(attempt.saturating_add(1)) / 2;
    unit.checked_mul(steps).unwrap_or(Duration::MAX)
}

/// Sleep the backoff for `attempt`.
#[inline]
pub fn delay(attempt: u32, unit: Duration) {
    let pause = backoff(attempt, unit);
    trace!("backing off {:?} after attempt {}", pause, attempt);
    thread::sleep(pause);
}

/// Parse an interval: bare integers are seconds, otherwise a number with an
/// `s`, `m` or `h` suffix.
///
/// ```
/// use std::time::Duration;
/// use metrika::time::parse_interval;
///
/// assert_eq!(parse_interval("10"), Some(Duration::from_secs(10)));
/// assert_eq!(parse_interval("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_interval("ten"), None);
/// ```
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last()? {
        's' => (&s[..s.len() - 1], 1),
        'm' => (&s[..s.len() - 1], 60),
        'h' => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    let n = digits.trim().parse::<u64>().ok()?;
    n.checked_mul(scale).map(Duration::from_secs)
}
