use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::options::Settings;

const EXPONENTIAL_COOLDOWN_CAP: Duration = Duration::from_secs(5);

/// Why a bounded wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// Time and attempt accounting for a single generation call.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    pub started: Instant,
    pub deadline: Instant,
    pub per_attempt_timeout: Duration,
    pub inter_poll: Duration,
    pub exponential_cooldown: bool,
    pub submission_attempts: u32,
    submissions_used: u32,
}

impl RetryBudget {
    pub fn start(settings: &Settings) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + settings.overall_deadline,
            per_attempt_timeout: settings.per_attempt_timeout,
            inter_poll: settings.inter_poll,
            exponential_cooldown: settings.exponential_cooldown,
            submission_attempts: settings.submission_attempts,
            submissions_used: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Timeout for the next HTTP attempt; never reaches past the deadline.
    pub fn attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout.min(self.remaining())
    }

    /// Counts one submission attempt. `false` once the retry budget is spent.
    pub fn take_submission_attempt(&mut self) -> bool {
        if self.submissions_used >= self.submission_attempts {
            return false;
        }
        self.submissions_used += 1;
        true
    }

    pub fn submissions_used(&self) -> u32 {
        self.submissions_used
    }

    /// Gives back an attempt that did not count against the retry budget.
    pub fn refund_submission_attempt(&mut self) {
        self.submissions_used = self.submissions_used.saturating_sub(1);
    }

    /// Starts a fresh retry count for a re-submission. The deadline stays.
    pub fn reset_submission_attempts(&mut self) {
        self.submissions_used = 0;
    }

    /// Delay before the next poll. `streak` counts the non-terminal polls in a row.
    pub fn cooldown(&self, streak: u32) -> Duration {
        if !self.exponential_cooldown {
            return self.inter_poll;
        }
        let factor = 1u32 << streak.saturating_sub(1).min(8);
        self.inter_poll
            .saturating_mul(factor)
            .min(EXPONENTIAL_COOLDOWN_CAP.max(self.inter_poll))
    }

    /// Runs `fut` until it finishes, the caller cancels, or the deadline passes.
    pub async fn bounded<F: Future>(
        &self,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<F::Output, Interrupt> {
        race(cancel, self.deadline, fut).await
    }

    /// Sleeps for `duration`, cut short by the deadline or cancellation.
    pub async fn sleep(&self, cancel: &CancellationToken, duration: Duration) -> Result<(), Interrupt> {
        self.bounded(cancel, sleep(duration)).await
    }
}

/// `fut` raced against cancellation and an absolute deadline. Cancellation
/// wins ties.
pub async fn race<F: Future>(
    cancel: &CancellationToken,
    deadline: Instant,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = sleep_until(deadline) => Err(Interrupt::DeadlineExceeded),
        out = fut => Ok(out),
    }
}
