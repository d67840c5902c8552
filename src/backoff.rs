use crate::constants::{FALLBACK_RETRY_DELAY, MAX_ATTEMPTS, RETRY_DELAYS};
use crate::types::{OnelineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
    pub fallback_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            delays: RETRY_DELAYS.to_vec(),
            fallback_delay: FALLBACK_RETRY_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, delays: Vec<Duration>, fallback_delay: Duration) -> Self {
        self.delays = delays;
        self.fallback_delay = fallback_delay;
        self
    }

    /// Delay to wait after `attempt` (1-based) has failed.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        match self.delays.get(idx) {
            Some(d) => *d,
            None => self.fallback_delay,
        }
    }

    pub fn is_retryable(&self, err: &OnelineError) -> bool {
        match err {
            OnelineError::Network { .. } | OnelineError::Io(_) | OnelineError::UpstreamHttp(..) => {
                true
            }
            OnelineError::Cancelled
            | OnelineError::Configuration(_)
            | OnelineError::RetriesExhausted { .. }
            | OnelineError::Serialization(_)
            | OnelineError::Internal(..) => false,
        }
    }

    /// Whether another attempt should follow the failure of `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, err: &OnelineError) -> bool {
        attempt < self.max_attempts && self.is_retryable(err)
    }

    /// Wraps the last error once the attempt budget is spent. Non-retryable errors pass through.
    pub fn exhausted(&self, attempts: u32, err: OnelineError) -> OnelineError {
        if self.is_retryable(&err) {
            OnelineError::RetriesExhausted {
                attempts,
                last: Box::new(err),
            }
        } else {
            err
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OnelineError::Cancelled.into()),
                outcome = operation(attempts) => outcome,
            };
            match outcome {
                Ok(val) => return Ok(val),
                Err(e) if self.should_retry(attempts, &e.inner) => {
                    let delay = self.next_delay(attempts);
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] Attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempts,
                        self.max_attempts,
                        e.inner,
                        delay
                    );
                    cancellable_sleep(delay, cancel).await?;
                }
                Err(e) => {
                    tracing::error!(
                        "[☁️  -> ⚙️ ] Giving up after {} attempt(s): {}",
                        attempts,
                        e.inner
                    );
                    return Err(self.exhausted(attempts, e.inner).into());
                }
            }
        }
    }
}

/// Sleeps for `delay` unless the caller cancels first.
pub async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OnelineError::Cancelled.into()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_delays_follow_sequence_then_fallback() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(5));
        assert_eq!(policy.next_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (1..=6).map(|a| policy.next_delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_classification() {
        let policy = BackoffPolicy::default();
        assert!(policy.is_retryable(&OnelineError::network("connection reset")));
        assert!(policy.is_retryable(&OnelineError::timeout("deadline")));
        assert!(policy.is_retryable(&OnelineError::UpstreamHttp(
            StatusCode::BAD_REQUEST,
            "bad".into()
        )));
        assert!(!policy.is_retryable(&OnelineError::Cancelled));
        assert!(!policy.is_retryable(&OnelineError::Configuration("no key".into())));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = BackoffPolicy::new(3);
        let err = OnelineError::network("reset");
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        assert_eq!(BackoffPolicy::new(0).max_attempts, 1);
    }
}
