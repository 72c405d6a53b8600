use std::future::Future;
use std::time::Duration;

use fleetlease_core::{AppError, AppResult};
use tokio::time::Instant;
use tracing::warn;

/// Sleep-and-retry policy injected into every polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Optional cap on attempts.
    pub max_attempts: Option<u32>,
    /// Optional overall deadline measured from the first attempt.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Polls forever with a fixed interval.
    #[must_use]
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: None,
        }
    }

    /// Adds an overall deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Adds an attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Starts tracking one retry loop.
    #[must_use]
    pub fn start(&self) -> RetryBudget {
        RetryBudget {
            policy: *self,
            started_at: Instant::now(),
            attempts: 0,
        }
    }

    /// Runs one store write, repeating it while the store is unavailable.
    ///
    /// Other errors return at once. When the budget runs out the last
    /// `StoreUnavailable` error is returned.
    pub async fn retry_unavailable<T, F, Fut>(&self, operation: &str, mut write: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut budget = self.start();
        loop {
            match write().await {
                Err(error @ AppError::StoreUnavailable(_)) => {
                    warn!(
                        operation,
                        attempts = budget.attempts(),
                        error = %error,
                        "store write failed, retrying"
                    );
                    if budget.wait(operation).await.is_err() {
                        return Err(error);
                    }
                }
                result => return result,
            }
        }
    }
}

/// Attempt and deadline bookkeeping for one running retry loop.
#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    started_at: Instant,
    attempts: u32,
}

impl RetryBudget {
    /// Number of attempts recorded so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time left before the deadline, when one is configured.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.policy
            .deadline
            .map(|deadline| deadline.saturating_sub(self.started_at.elapsed()))
    }

    /// Returns whether another attempt is allowed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        let attempts_exhausted = self
            .policy
            .max_attempts
            .is_some_and(|max_attempts| self.attempts >= max_attempts);
        let deadline_passed = self.remaining().is_some_and(|remaining| remaining.is_zero());

        attempts_exhausted || deadline_passed
    }

    /// Records a failed attempt and sleeps until the next one.
    ///
    /// Returns `AcquireTimeout` instead of sleeping once the budget is spent.
    pub async fn wait(&mut self, operation: &str) -> AppResult<()> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return Err(AppError::AcquireTimeout(format!(
                "{operation} gave up after {} attempts in {}ms",
                self.attempts,
                self.started_at.elapsed().as_millis()
            )));
        }

        let pause = match self.remaining() {
            Some(remaining) => self.policy.interval.min(remaining),
            None => self.policy.interval,
        };
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        Ok(())
    }
}
