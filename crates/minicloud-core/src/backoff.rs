//! Exponential backoff with a total time budget.
//!
//! Used for connecting to a just-started external process (the hypervisor
//! monitor socket appears some time after spawn). Waits double from the
//! first interval and are clipped so the sum never exceeds the budget.

use std::time::Duration;
use tokio::time::Instant;

/// Successive doubling waits bounded by a total budget.
#[derive(Debug)]
pub struct Backoff {
    deadline: Instant,
    next_wait: Duration,
}

impl Backoff {
    /// Creates a backoff that starts with `first_wait` and never sleeps past
    /// `budget` from now.
    #[must_use]
    pub fn new(first_wait: Duration, budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            next_wait: first_wait,
        }
    }

    /// Sleeps for the next interval.
    ///
    /// Returns `false` without sleeping once the budget is exhausted.
    pub async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let mut wait = self.next_wait;
        self.next_wait = self.next_wait.saturating_mul(2);
        if now + wait > self.deadline {
            wait = self.deadline - now;
        }
        tokio::time::sleep(wait).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_double_until_budget() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        let start = Instant::now();
        assert!(backoff.wait().await); // 100ms
        assert!(backoff.wait().await); // 200ms
        assert!(backoff.wait().await); // 400ms
        assert!(backoff.wait().await); // clipped to 300ms
        assert!(!backoff.wait().await);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_false_immediately() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::ZERO);
        assert!(!backoff.wait().await);
    }
}
