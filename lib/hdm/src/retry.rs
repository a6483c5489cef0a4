//! Jittered exponential backoff, shared by the Worker Pool and the durable
//! idempotency store. Grounded in the teacher's `musicbrainz::with_retry` helper.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// `delay = retry_base * 2^(attempt-1) * (1 + U(-jitter_pct, +jitter_pct))`, clamped to
/// `>= 0`. `attempt` is 1-based. `rng` is injectable so tests can pin delays.
pub fn backoff_delay(
    retry_base_seconds: f64,
    attempt: u32,
    jitter_pct: f64,
    rng: &mut impl Rng,
) -> Duration {
    let exponential = retry_base_seconds * 2f64.powi(attempt as i32 - 1);
    let jitter = if jitter_pct > 0.0 {
        rng.random_range(-jitter_pct..=jitter_pct)
    } else {
        0.0
    };
    let delay = (exponential * (1.0 + jitter)).max(0.0);
    Duration::from_secs_f64(delay)
}

/// Apply a retry-after hint on top of the computed backoff: `max(delay, retry_after)`.
/// Must run *after* the jitter clamp, never before.
pub fn apply_retry_after(delay: Duration, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => delay.max(hint),
        None => delay,
    }
}

/// Whether an error should be retried: callers classify via `is_retryable`.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry an async operation up to `max_attempts` times with jittered exponential
/// backoff, for errors classified as retryable. Used by the durable idempotency store
/// to ride out `SQLITE_BUSY`/`SQLITE_LOCKED` conditions.
pub async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    base_seconds: f64,
    jitter_pct: f64,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut rng = rand::rng();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let delay = backoff_delay(base_seconds, attempt, jitter_pct, &mut rng);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn backoff_is_monotone_without_jitter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let d1 = backoff_delay(0.5, 1, 0.0, &mut rng);
        let d2 = backoff_delay(0.5, 2, 0.0, &mut rng);
        let d3 = backoff_delay(0.5, 3, 0.0, &mut rng);
        assert_eq!(d1, Duration::from_secs_f64(0.5));
        assert_eq!(d2, Duration::from_secs_f64(1.0));
        assert_eq!(d3, Duration::from_secs_f64(2.0));
    }

    #[test]
    fn retry_after_hint_wins_when_larger() {
        let delay = Duration::from_secs_f64(0.5);
        let hint = Duration::from_secs_f64(5.0);
        assert_eq!(apply_retry_after(delay, Some(hint)), hint);
        assert_eq!(apply_retry_after(delay, None), delay);
        assert_eq!(
            apply_retry_after(delay, Some(Duration::from_secs_f64(0.1))),
            delay
        );
    }
}
