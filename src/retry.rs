use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::VmError;

/// Outcome of one attempt inside a [`RetryPolicy`] loop.
pub enum Attempt<T> {
    Done(T),
    /// Not yet; the reason is kept as the last observed failure.
    Retry(String),
    /// Stop retrying and surface this error immediately.
    Abort(VmError),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s): {}", last.as_deref().unwrap_or("no attempt completed"))]
    Exhausted { attempts: u32, last: Option<String> },

    #[error("canceled after {attempts} attempt(s)")]
    Canceled { attempts: u32, last: Option<String> },

    #[error(transparent)]
    Aborted(VmError),
}

impl RetryError {
    pub fn last_failure(&self) -> Option<&str> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Canceled { last, .. } => {
                last.as_deref()
            }
            RetryError::Aborted(_) => None,
        }
    }
}

/// Fixed-interval retry with an overall deadline, optional attempt cap and
/// cooperative cancellation. An attempt still running when the deadline
/// passes is dropped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub deadline: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let deadline = Instant::now() + self.deadline;
        let mut attempts = 0;
        let mut last = None;

        loop {
            attempts += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Canceled { attempts, last }),
                outcome = tokio::time::timeout_at(deadline, attempt(attempts)) => outcome,
            };

            match outcome {
                Err(_) => return Err(RetryError::Exhausted { attempts, last }),
                Ok(Attempt::Done(value)) => return Ok(value),
                Ok(Attempt::Abort(e)) => return Err(RetryError::Aborted(e)),
                Ok(Attempt::Retry(reason)) => {
                    tracing::debug!(attempt = attempts, %reason, "attempt did not succeed");
                    last = Some(reason);
                }
            }

            let capped = self.max_attempts.is_some_and(|max| attempts >= max);
            let next = Instant::now() + self.interval;
            if capped || next >= deadline {
                return Err(RetryError::Exhausted { attempts, last });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Canceled { attempts, last }),
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }
}
