//! Jittered exponential backoff and error classification (spec §4.4).

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::EdgeBotError;

/// How a completed attempt's error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Permanent,
}

/// Classifies an HTTP status per §4.4. 2xx never reaches here.
pub fn classify_http_status(status: u16) -> Classification {
    match status {
        408 | 425 | 429 | 500 | 502 | 503 | 504 => Classification::Transient,
        400 | 401 | 403 | 404 | 409 | 413 | 415 | 422 => Classification::Permanent,
        _ => Classification::Transient,
    }
}

/// Attempt *k* (0-based) backoff duration, absent any `Retry-After` hint.
pub fn backoff_for_attempt(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = cfg.initial_backoff_ms as f64 * 2f64.powi(attempt as i32);
    let capped = base.min(cfg.max_backoff_ms as f64);
    let jitter = cfg.jitter_factor;
    let factor = if jitter <= 0.0 {
        1.0
    } else {
        1.0 + rand::rng().random_range(-jitter..=jitter)
    };
    Duration::from_millis((capped * factor).max(0.0) as u64)
}

/// Clamps a `Retry-After` hint (already resolved to seconds) to `max_backoff_ms`.
pub fn clamp_retry_after(seconds: f64, cfg: &RetryConfig) -> Duration {
    let ms = (seconds * 1000.0).max(0.0);
    Duration::from_millis(ms.min(cfg.max_backoff_ms as f64) as u64)
}

/// Result of one full retry cycle around a fallible async operation.
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted(EdgeBotError),
}

/// Drives `attempt` up to `cfg.max_retries` times. `attempt` returns either
/// `Ok(T)` or `Err((EdgeBotError, Option<retry_after_secs>))`; a `Permanent`
/// error short-circuits immediately without consuming further retries.
pub async fn run_with_retry<T, F, Fut>(cfg: &RetryConfig, mut attempt: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, (EdgeBotError, Option<f64>)>>,
{
    let mut last_err = EdgeBotError::Transient("no attempts made".into());
    for k in 0..=cfg.max_retries {
        match attempt(k).await {
            Ok(value) => return RetryOutcome::Success(value),
            Err((err, retry_after)) => {
                if err.is_permanent() {
                    return RetryOutcome::Exhausted(err);
                }
                last_err = err;
                if k == cfg.max_retries {
                    break;
                }
                let wait = match retry_after {
                    Some(secs) => clamp_retry_after(secs, cfg),
                    None => backoff_for_attempt(cfg, k),
                };
                tokio::time::sleep(wait).await;
            }
        }
    }
    RetryOutcome::Exhausted(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetryConfig {
        RetryConfig { max_retries: 5, initial_backoff_ms: 10, max_backoff_ms: 1000, jitter_factor: 0.0 }
    }

    #[test]
    fn classifies_known_transient_and_permanent_statuses() {
        assert_eq!(classify_http_status(503), Classification::Transient);
        assert_eq!(classify_http_status(429), Classification::Transient);
        assert_eq!(classify_http_status(400), Classification::Permanent);
        assert_eq!(classify_http_status(404), Classification::Permanent);
    }

    #[test]
    fn unmapped_non_2xx_defaults_transient() {
        assert_eq!(classify_http_status(599), Classification::Transient);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = cfg();
        assert_eq!(backoff_for_attempt(&c, 0), Duration::from_millis(10));
        assert_eq!(backoff_for_attempt(&c, 1), Duration::from_millis(20));
        assert_eq!(backoff_for_attempt(&c, 10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_until_success_then_stops() {
        let c = cfg();
        let mut calls = 0u32;
        let result = run_with_retry(&c, |k| {
            calls += 1;
            async move {
                if k < 2 {
                    Err((EdgeBotError::Transient("503".into()), None))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert!(matches!(result, RetryOutcome::Success(42)));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let c = cfg();
        let mut calls = 0u32;
        let result: RetryOutcome<()> = run_with_retry(&c, |_| {
            calls += 1;
            async { Err((EdgeBotError::Permanent("400".into()), None)) }
        })
        .await;
        assert!(matches!(result, RetryOutcome::Exhausted(EdgeBotError::Permanent(_))));
        assert_eq!(calls, 1);
    }
}
