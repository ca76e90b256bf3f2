use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::TranscodeSection;

/// Exponential backoff: `base * 2^retry`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (zero based).
    pub fn compute_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl From<&TranscodeSection> for RetryPolicy {
    fn from(section: &TranscodeSection) -> Self {
        Self::new(
            section.max_rendition_retries,
            Duration::from_secs(section.retry_base_s),
            Duration::from_secs(section.retry_cap_s),
        )
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the policy is exhausted. A cancelled token ends the backoff early and
/// returns the last error.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    stage: &str,
    cancel: &CancellationToken,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= attempts || !is_transient(&err) => return Err(err),
            Err(err) => {
                let delay = policy.compute_delay(attempt);
                attempt += 1;
                warn!(attempt, wait = ?delay, stage, error = %err, "retrying operation");
                if !delay.is_zero() {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(err),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<_> = (0..6).map(|retry| policy.compute_delay(retry).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(policy.compute_delay(40), Duration::from_secs(60));
        assert_eq!(policy.attempts(), 6);
    }

    #[tokio::test]
    async fn stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        let result: Result<(), String> = retry_transient(
            &policy,
            "test",
            &CancellationToken::new(),
            |err: &String| err.starts_with("transient"),
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err("transient glitch".to_string())
                    } else {
                        Err("permanent".to_string())
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_configured_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        let result: Result<(), String> = retry_transient(
            &policy,
            "test",
            &CancellationToken::new(),
            |_: &String| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("busy".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
