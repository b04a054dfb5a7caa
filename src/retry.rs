//! Fixed-delay retry policy for failed pipeline attempts.

use std::time::Duration;

use crate::error::AttemptFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is the retry number being scheduled.
    Retry { attempt: u32, delay: Duration },
    Fail,
    /// Nothing to do: the job was cancelled.
    Abandon,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn decide(&self, failure: &AttemptFailure, retry_count: u32) -> RetryDecision {
        match failure {
            AttemptFailure::Cancelled => RetryDecision::Abandon,
            AttemptFailure::Terminal(_) => RetryDecision::Fail,
            AttemptFailure::Recoverable(_) if retry_count < self.max_retries => RetryDecision::Retry {
                attempt: retry_count + 1,
                delay: self.delay,
            },
            AttemptFailure::Recoverable(_) => RetryDecision::Fail,
        }
    }
}
