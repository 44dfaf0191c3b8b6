use std::time::{Duration, Instant};

use crate::BatchError;

/// A bounded batch of items read for one transactional commit.
#[derive(Debug)]
pub struct Chunk<I> {
    pub items: Vec<I>,
    /// Set when the reader was exhausted while filling this chunk; the step
    /// completes after the chunk commits.
    pub end_of_stream: bool,
}

impl<I> Chunk<I> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            end_of_stream: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl<I> Default for Chunk<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides when the chunk being read is complete and should be committed.
/// Consulted after every item read.
pub trait CompletionPolicy: Send + Sync {
    fn is_complete(&self, items_in_chunk: usize, chunk_started: Instant) -> bool;
}

/// Fixed item count per chunk (the commit interval). The default policy.
pub struct ItemCountCompletionPolicy {
    commit_interval: usize,
}

impl ItemCountCompletionPolicy {
    pub fn new(commit_interval: usize) -> Self {
        Self {
            commit_interval: commit_interval.max(1),
        }
    }
}

impl CompletionPolicy for ItemCountCompletionPolicy {
    fn is_complete(&self, items_in_chunk: usize, _chunk_started: Instant) -> bool {
        items_in_chunk >= self.commit_interval
    }
}

/// Closes the chunk once it has been open longer than the timeout, bounding
/// the amount of work lost to a rollback when reads are slow.
pub struct TimeoutCompletionPolicy {
    timeout: Duration,
}

impl TimeoutCompletionPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutCompletionPolicy {
    fn is_complete(&self, items_in_chunk: usize, chunk_started: Instant) -> bool {
        items_in_chunk > 0 && chunk_started.elapsed() >= self.timeout
    }
}

/// Classifies an error raised during read/process/write as skippable (the
/// item is dropped and execution continues) or fatal.
pub trait SkipPolicy: Send + Sync {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool;
}

/// Skips item-level errors up to a fixed limit; everything else is fatal.
pub struct LimitCheckingSkipPolicy {
    skip_limit: usize,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: usize) -> Self {
        Self { skip_limit }
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool {
        error.is_item_error() && skip_count < self.skip_limit
    }
}

/// Never skips; any item error is fatal. The default.
pub struct NeverSkipPolicy;

impl SkipPolicy for NeverSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> bool {
        false
    }
}

/// Skips every item-level error, regardless of count.
pub struct AlwaysSkipPolicy;

impl SkipPolicy for AlwaysSkipPolicy {
    fn should_skip(&self, error: &BatchError, _skip_count: usize) -> bool {
        error.is_item_error()
    }
}

/// Bounds how often a failed operation is re-attempted before the skip
/// policy is consulted.
pub trait RetryPolicy: Send + Sync {
    /// `attempts` counts the attempts already made, including the first one.
    fn can_retry(&self, error: &BatchError, attempts: usize) -> bool;
}

/// Retries item-level errors up to a fixed number of attempts.
pub struct SimpleRetryPolicy {
    max_attempts: usize,
}

impl SimpleRetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, error: &BatchError, attempts: usize) -> bool {
        error.is_item_error() && attempts < self.max_attempts
    }
}

/// Gives up immediately. The default when no retry limit is configured.
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, _error: &BatchError, _attempts: usize) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_count_policy_closes_at_the_commit_interval() {
        let policy = ItemCountCompletionPolicy::new(4);
        let started = Instant::now();
        assert!(!policy.is_complete(3, started));
        assert!(policy.is_complete(4, started));
    }

    #[test]
    fn zero_commit_interval_is_clamped_to_one() {
        let policy = ItemCountCompletionPolicy::new(0);
        assert!(policy.is_complete(1, Instant::now()));
    }

    #[test]
    fn timeout_policy_keeps_at_least_one_item() {
        let policy = TimeoutCompletionPolicy::new(Duration::ZERO);
        let started = Instant::now() - Duration::from_secs(1);
        assert!(!policy.is_complete(0, started));
        assert!(policy.is_complete(1, started));
    }

    #[test]
    fn limit_checking_skip_policy_honours_the_limit() {
        let policy = LimitCheckingSkipPolicy::new(2);
        let error = BatchError::ItemReader("bad record".to_string());
        assert!(policy.should_skip(&error, 0));
        assert!(policy.should_skip(&error, 1));
        assert!(!policy.should_skip(&error, 2));
    }

    #[test]
    fn non_item_errors_are_never_skippable() {
        let policy = AlwaysSkipPolicy;
        let fatal = BatchError::Transaction("broken".to_string());
        assert!(!policy.should_skip(&fatal, 0));
    }

    #[test]
    fn simple_retry_policy_counts_attempts() {
        let policy = SimpleRetryPolicy::new(3);
        let error = BatchError::ItemWriter("flaky sink".to_string());
        assert!(policy.can_retry(&error, 1));
        assert!(policy.can_retry(&error, 2));
        assert!(!policy.can_retry(&error, 3));
    }
}
