//! Retry policy for failed delivery attempts.
//!
//! A job gets a fixed number of delivery attempts. Every full failure
//! advances the retry counter and returns the job to the queue, where the
//! next poll picks it up; there is no backoff delay between attempts. Once
//! the counter reaches the maximum the job moves to the dead-letter queue
//! for manual inspection.

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MAX_RETRIES;

/// Decides what happens to a job after a full delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of failed attempts after which a job is dead-lettered.
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// Outcome of a retry decision for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to the queue with the advanced counter.
    Requeue {
        /// Retry counter value to persist
        retries: i32,
    },
    /// The attempt budget is exhausted; move the job to the dead-letter
    /// queue with the advanced counter.
    DeadLetter {
        /// Retry counter value to persist
        retries: i32,
    },
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget.
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    /// Decides the fate of a job whose current attempt just failed.
    ///
    /// `current_retries` is the counter persisted before this attempt. The
    /// counter always advances by one; the job dead-letters when the
    /// advanced counter reaches `max_retries`.
    pub fn decide(&self, current_retries: i32) -> RetryDecision {
        let retries = current_retries + 1;
        if retries >= self.max_retries {
            RetryDecision::DeadLetter { retries }
        } else {
            RetryDecision::Requeue { retries }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_five_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);

        assert_eq!(policy.decide(0), RetryDecision::Requeue { retries: 1 });
        assert_eq!(policy.decide(1), RetryDecision::Requeue { retries: 2 });
        assert_eq!(policy.decide(2), RetryDecision::Requeue { retries: 3 });
        assert_eq!(policy.decide(3), RetryDecision::Requeue { retries: 4 });
        assert_eq!(policy.decide(4), RetryDecision::DeadLetter { retries: 5 });
    }

    #[test]
    fn single_attempt_policy_dead_letters_immediately() {
        let policy = RetryPolicy::new(1);
        assert_eq!(policy.decide(0), RetryDecision::DeadLetter { retries: 1 });
    }

    #[test]
    fn counter_past_maximum_still_dead_letters() {
        // A lowered maximum must not requeue jobs that already exceeded it.
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.decide(7), RetryDecision::DeadLetter { retries: 8 });
    }
}
