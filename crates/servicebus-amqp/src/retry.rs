//! # Retry Module
//!
//! Bounded-attempt retry of asynchronous operations with a fixed delay between
//! attempts.
//!
//! Failures are classified through [`ReceiverError::is_retryable`]; a terminal
//! error ends the retry immediately, a retryable one is retried until the
//! attempt budget is spent, after which the last error is returned.

use crate::error::ReceiverError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Kind of operation being retried, used to label log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryOperationType {
    ReceiverLink,
    SenderLink,
    SessionLink,
    SendMessage,
    Management,
}

impl fmt::Display for RetryOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReceiverLink => write!(f, "receiver link"),
            Self::SenderLink => write!(f, "sender link"),
            Self::SessionLink => write!(f, "session link"),
            Self::SendMessage => write!(f, "send message"),
            Self::Management => write!(f, "management operation"),
        }
    }
}

/// Retry policy with a fixed delay between attempts
///
/// # Examples
///
/// ```rust
/// use servicebus_amqp::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(5));
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay between consecutive attempts, in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay between attempts
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Check whether another attempt may follow the given (1-based) attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds, fails terminally, or the policy's
/// attempt budget is exhausted.
///
/// # Examples
///
/// ```rust
/// use servicebus_amqp::retry::{retry, RetryOperationType, RetryPolicy};
/// use servicebus_amqp::ReceiverError;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let policy = RetryPolicy::new(3, Duration::ZERO);
/// let value = retry(
///     || async { Ok::<_, ReceiverError>(42) },
///     RetryOperationType::Management,
///     &policy,
/// )
/// .await;
///
/// assert_eq!(value.unwrap(), 42);
/// # });
/// ```
pub async fn retry<T, F, Fut>(
    mut operation: F,
    operation_type: RetryOperationType,
    policy: &RetryPolicy,
) -> Result<T, ReceiverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReceiverError>>,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_type, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                warn!(
                    operation = %operation_type,
                    attempt,
                    error = %error,
                    "Operation failed with a non-retryable error"
                );
                return Err(error);
            }
            Err(error) if !policy.should_retry(attempt) => {
                warn!(
                    operation = %operation_type,
                    attempts = attempt,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(error);
            }
            Err(error) => {
                debug!(
                    operation = %operation_type,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = policy.delay_ms,
                    error = %error,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
        }
    }
}
