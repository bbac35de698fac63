use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

use crate::error::{CuadraError, Result};
use crate::settings::AiSettings;

/// Bounded retries with exponential backoff for remote calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            factor: 2,
        }
    }

    pub fn from_settings(ai: &AiSettings) -> Self {
        Self::new(ai.max_attempts, Duration::from_millis(ai.base_delay_ms))
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(self.factor.saturating_pow(exp))
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out. The
    /// closure receives the 1-based attempt number.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        call = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Remote call failed, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transport failures, server errors, rate limiting and malformed replies
/// are worth another attempt. Other client errors are not.
pub fn is_retryable(err: &CuadraError) -> bool {
    match err {
        CuadraError::Http(e) => match e.status() {
            Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode(),
        },
        CuadraError::Classification(_) | CuadraError::Json(_) | CuadraError::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO)
    }

    #[test]
    fn test_delay_is_exponential() {
        let p = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result = instant(3).run("test", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(CuadraError::Classification("bad json".into()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = instant(2).run("test", |_| {
            calls.set(calls.get() + 1);
            Err(CuadraError::Classification("still bad".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = instant(5).run("test", |_| {
            calls.set(calls.get() + 1);
            Err(CuadraError::Settings("no key".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
