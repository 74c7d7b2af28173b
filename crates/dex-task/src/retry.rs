//! Caller-side retry for pipelines that failed on a transient error.
//!
//! The runner itself never retries. A caller that classifies an error as
//! transient (peer unreachable, wallet temporarily unavailable) resumes the
//! pipeline at the failed task's index after an exponential backoff, so tasks
//! that already completed are not executed again.

use std::time::Duration;

use crate::runner::{RunReport, TaskFailure, TaskRunner};

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total runs allowed, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each later retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `runner`, resuming from the failed task while `is_transient`
    /// accepts the error and attempts remain.
    ///
    /// The returned report lists every task completed across all attempts.
    pub async fn run<M, E>(
        &self,
        runner: &TaskRunner<M, E>,
        model: &mut M,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<RunReport, TaskFailure<E>>
    where
        M: Send + 'static,
        E: Send + 'static,
    {
        self.resume(runner, model, 0, is_transient).await
    }

    /// As [`RetryPolicy::run`], starting at task `start`.
    pub async fn resume<M, E>(
        &self,
        runner: &TaskRunner<M, E>,
        model: &mut M,
        start: usize,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<RunReport, TaskFailure<E>>
    where
        M: Send + 'static,
        E: Send + 'static,
    {
        let mut next = start;
        let mut completed = Vec::new();
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match runner.run_from(model, next).await {
                Ok(report) => {
                    completed.extend(report.completed);
                    return Ok(RunReport {
                        pipeline: report.pipeline,
                        started_at: start,
                        completed,
                    });
                }
                Err(failure) => {
                    attempt += 1;
                    if attempt >= attempts || !is_transient(&failure.error) {
                        return Err(failure);
                    }
                    // Tasks before the failed index completed on this attempt.
                    completed.extend(
                        runner.task_names()[next..failure.index]
                            .iter()
                            .map(|name| name.to_string()),
                    );
                    next = failure.index;
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        pipeline = %failure.pipeline,
                        task = %failure.task,
                        attempt,
                        max_attempts = attempts,
                        "transient task failure, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
