use thiserror::Error;

/// Batch error
///
/// Single error type for the whole engine. Variants fall into four groups:
/// item-level errors (reader/processor/writer), restart-policy violations
/// raised when a job execution is created, concurrency conflicts detected by
/// the repository, and configuration errors raised at build time.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("ItemReader error: {0}")]
    ItemReader(String),

    #[error("ItemProcessor error: {0}")]
    ItemProcessor(String),

    #[error("ItemWriter error: {0}")]
    ItemWriter(String),

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Flow execution error: {0}")]
    FlowExecution(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Optimistic locking failure: {0}")]
    OptimisticLockingFailure(String),

    #[error("A job execution for this instance is already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("Job is not restartable: {0}")]
    JobRestart(String),

    #[error("Job instance is already complete: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("Job was interrupted: {0}")]
    JobInterrupted(String),

    #[error("Start limit exceeded for step: {0}")]
    StartLimitExceeded(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl BatchError {
    /// Item-level errors are the only candidates for skip and retry; every
    /// other variant is fatal to the running step.
    pub fn is_item_error(&self) -> bool {
        matches!(
            self,
            BatchError::ItemReader(_) | BatchError::ItemProcessor(_) | BatchError::ItemWriter(_)
        )
    }
}
