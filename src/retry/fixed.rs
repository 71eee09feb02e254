use super::RetryPolicy;
use crate::error::DiscoveryError;
use std::time::Duration;

/// 固定延迟重试策略
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        // 只对可重试的错误进行重试
        error.is_retryable()
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_backend_errors_until_exhausted() {
        let policy = FixedRetryPolicy::new(3, Duration::from_millis(50));
        let err = DiscoveryError::backend("call", "connection refused");

        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(50));
    }

    #[test]
    fn test_does_not_retry_unavailable() {
        let policy = FixedRetryPolicy::new(3, Duration::from_millis(50));
        let err = DiscoveryError::unavailable("user-service");
        assert!(!policy.should_retry(1, &err));
    }
}
