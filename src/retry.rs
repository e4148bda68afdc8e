// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bounded exponential backoff for store writes.

use crate::config::Config;
use crate::error::AppError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.write_max_attempts.max(1),
            base_delay: config.write_base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base…
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts. Only [`AppError::is_transient`] errors are retried.
///
/// Returns the value and the number of attempts, or the last error and the
/// number of attempts.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<(T, u32), (AppError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempts)),
            Err(e) => {
                if !e.is_transient() || attempts >= policy.max_attempts {
                    return Err((e, attempts));
                }
                let delay = policy.delay_for(attempts);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delays_double() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let calls = Cell::new(0);
        let result = retry_transient(policy(), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 2 {
                    Err(AppError::Database("aborted".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let result: Result<((), u32), _> = retry_transient(policy(), || async {
            Err(AppError::UpstreamUnavailable("down".into()))
        })
        .await;
        let (error, attempts) = result.unwrap_err();
        assert!(matches!(error, AppError::UpstreamUnavailable(_)));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<((), u32), _> = retry_transient(policy(), || {
            calls.set(calls.get() + 1);
            async { Err(AppError::NotFound("course".into())) }
        })
        .await;
        let (error, attempts) = result.unwrap_err();
        assert!(matches!(error, AppError::NotFound(_)));
        assert_eq!(attempts, 1);
        assert_eq!(calls.get(), 1);
    }
}
