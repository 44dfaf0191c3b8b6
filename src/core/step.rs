use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};

use super::chunk::{
    Chunk, CompletionPolicy, ItemCountCompletionPolicy, LimitCheckingSkipPolicy, NeverRetryPolicy,
    NeverSkipPolicy, RetryPolicy, SimpleRetryPolicy, SkipPolicy,
};
use super::execution::{ExecutionContext, StepExecution};
use super::item::{ItemProcessor, ItemReader, ItemWriter, PassThroughProcessor};
use super::repository::JobRepository;
use super::status::{BatchStatus, ExitStatus};
use super::transaction::{ResourcelessTransactionManager, TransactionManager};
use crate::BatchError;

/// Per-step execution rules consulted by the job driver.
#[derive(Debug, Clone, Copy)]
pub struct StepProperties {
    /// Maximum number of attempts of this step across all restarts of the
    /// same job instance.
    pub start_limit: usize,
    /// Re-run the step on restart even when a previous attempt completed.
    pub allow_start_if_complete: bool,
    /// Persist and rehydrate the restart position through the execution
    /// context. When false the step always restarts from scratch.
    pub save_state: bool,
}

impl Default for StepProperties {
    fn default() -> Self {
        Self {
            start_limit: usize::MAX,
            allow_start_if_complete: false,
            save_state: true,
        }
    }
}

/// One unit of execution within a job.
///
/// The engine mutates the passed `StepExecution` and persists it through the
/// repository at every chunk boundary; the final status is recorded in the
/// execution even when `execute` returns an error.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn properties(&self) -> StepProperties {
        StepProperties::default()
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError>;
}

/// Chunk-oriented step: repeated read/process/write cycles, each inside one
/// transaction scope.
///
/// Items are read until the completion policy closes the chunk or the source
/// is exhausted, processed one by one, and written as a batch. Counters and
/// the execution context are persisted atomically with the chunk commit, so
/// a crash loses at most the in-flight chunk. Fault tolerance on item
/// failure consults the retry policy first, then the skip policy; anything
/// else rolls the chunk back and fails the step.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    completion_policy: Box<dyn CompletionPolicy>,
    skip_policy: Box<dyn SkipPolicy>,
    retry_policy: Box<dyn RetryPolicy>,
    transaction_manager: Arc<dyn TransactionManager>,
    properties: StepProperties,
}

struct ChunkOutcome {
    end_of_stream: bool,
    committed_items: usize,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn properties(&self) -> StepProperties {
        self.properties
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        info!("Start of step: {}", self.name);
        step_execution.start_time = Some(Utc::now());
        step_execution.status = BatchStatus::Started;
        step_execution.exit_status = ExitStatus::executing();
        self.persist(step_execution, repository)?;

        if self.properties.save_state {
            self.reader.open(&step_execution.execution_context)?;
        } else {
            self.reader.open(&ExecutionContext::new())?;
        }
        self.writer.open()?;

        let outcome = self.chunk_loop(step_execution, repository);

        Self::log_close_error(self.reader.close());
        Self::log_close_error(self.writer.close());

        step_execution.end_time = Some(Utc::now());
        match outcome {
            Ok(()) => {
                step_execution.status = BatchStatus::Completed;
                step_execution.exit_status = ExitStatus::completed();
                self.persist(step_execution, repository)?;
                info!(
                    "End of step: {} (read: {}, written: {}, skipped: {})",
                    self.name,
                    step_execution.read_count,
                    step_execution.write_count,
                    step_execution.skip_count()
                );
                Ok(())
            }
            Err(error @ BatchError::JobInterrupted(_)) => {
                warn!("Step {} stopped on request", self.name);
                step_execution.status = BatchStatus::Stopped;
                step_execution.exit_status = ExitStatus::stopped();
                self.persist(step_execution, repository)?;
                Err(error)
            }
            Err(error) => {
                step_execution.status = BatchStatus::Failed;
                step_execution.exit_status =
                    ExitStatus::failed().add_exit_description(&error.to_string());
                // A failure to persist the failed state wins over the
                // original error, otherwise the run could look successful.
                self.persist(step_execution, repository)?;
                Err(error)
            }
        }
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn chunk_loop(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        loop {
            // Interruption is only honoured between chunks, so a stop
            // request never tears a transaction apart mid-chunk.
            if step_execution.is_terminate_only() {
                return Err(BatchError::JobInterrupted(format!(
                    "step '{}' was asked to terminate",
                    self.name
                )));
            }

            self.transaction_manager.begin()?;
            match self.process_chunk(step_execution) {
                Ok(outcome) => {
                    if outcome.committed_items > 0 || !outcome.end_of_stream {
                        step_execution.commit_count += 1;
                    }
                    if self.properties.save_state {
                        self.reader.update(&mut step_execution.execution_context)?;
                    }
                    if let Err(error) = self.persist(step_execution, repository) {
                        self.transaction_manager.rollback()?;
                        step_execution.rollback_count += 1;
                        return Err(error);
                    }
                    self.transaction_manager.commit()?;
                    if outcome.end_of_stream {
                        return Ok(());
                    }
                }
                Err(error) => {
                    self.transaction_manager.rollback()?;
                    step_execution.rollback_count += 1;
                    return Err(error);
                }
            }
        }
    }

    /// One full read/process/write cycle inside an open transaction scope.
    fn process_chunk(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<ChunkOutcome, BatchError> {
        let chunk = self.read_chunk(step_execution)?;
        let end_of_stream = chunk.end_of_stream;
        if chunk.is_empty() {
            return Ok(ChunkOutcome {
                end_of_stream,
                committed_items: 0,
            });
        }

        let processed = self.process_items(step_execution, &chunk.items)?;
        let committed_items = processed.len();
        self.write_items(step_execution, &processed)?;

        Ok(ChunkOutcome {
            end_of_stream,
            committed_items,
        })
    }

    fn read_chunk(&self, step_execution: &mut StepExecution) -> Result<Chunk<I>, BatchError> {
        debug!("Start reading chunk");
        let chunk_started = Instant::now();
        let mut chunk = Chunk::new();

        loop {
            if self
                .completion_policy
                .is_complete(chunk.len(), chunk_started)
            {
                debug!("End reading chunk: full ({} items)", chunk.len());
                return Ok(chunk);
            }

            match self.reader.read() {
                Ok(Some(item)) => {
                    chunk.items.push(item);
                    step_execution.read_count += 1;
                }
                Ok(None) => {
                    debug!(
                        "End reading chunk: source exhausted ({} items)",
                        chunk.len()
                    );
                    chunk.end_of_stream = true;
                    return Ok(chunk);
                }
                Err(error) => {
                    if self
                        .skip_policy
                        .should_skip(&error, step_execution.skip_count())
                    {
                        step_execution.read_skip_count += 1;
                        warn!(
                            "Skipping unreadable item in step '{}': {}",
                            self.name, error
                        );
                    } else {
                        return Err(error);
                    }
                }
            }
        }
    }

    fn process_items(
        &self,
        step_execution: &mut StepExecution,
        items: &[I],
    ) -> Result<Vec<O>, BatchError> {
        debug!("Processing chunk of {} items", items.len());
        let mut processed = Vec::with_capacity(items.len());

        for item in items {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.processor.process(item) {
                    Ok(output) => {
                        processed.push(output);
                        break;
                    }
                    Err(error) => {
                        if self.retry_policy.can_retry(&error, attempts) {
                            warn!(
                                "Retrying item in step '{}' (attempt {}): {}",
                                self.name, attempts, error
                            );
                            continue;
                        }
                        if self
                            .skip_policy
                            .should_skip(&error, step_execution.skip_count())
                        {
                            step_execution.process_skip_count += 1;
                            warn!("Skipping item in step '{}': {}", self.name, error);
                            break;
                        }
                        return Err(error);
                    }
                }
            }
        }

        Ok(processed)
    }

    fn write_items(
        &self,
        step_execution: &mut StepExecution,
        items: &[O],
    ) -> Result<(), BatchError> {
        if items.is_empty() {
            return Ok(());
        }
        debug!("Writing chunk of {} items", items.len());

        let mut attempts = 0;
        let error = loop {
            attempts += 1;
            match self.writer.write(items).and_then(|()| self.writer.flush()) {
                Ok(()) => {
                    step_execution.write_count += items.len();
                    return Ok(());
                }
                Err(error) => {
                    if self.retry_policy.can_retry(&error, attempts) {
                        warn!(
                            "Retrying chunk write in step '{}' (attempt {}): {}",
                            self.name, attempts, error
                        );
                        continue;
                    }
                    break error;
                }
            }
        };

        if !self
            .skip_policy
            .should_skip(&error, step_execution.skip_count())
        {
            return Err(error);
        }

        // Retries exhausted on a skippable failure: scan the chunk one item
        // at a time so only the offending items are dropped.
        warn!(
            "Scanning chunk in step '{}' after write failure: {}",
            self.name, error
        );
        for item in items {
            match self
                .writer
                .write(std::slice::from_ref(item))
                .and_then(|()| self.writer.flush())
            {
                Ok(()) => step_execution.write_count += 1,
                Err(item_error) => {
                    if self
                        .skip_policy
                        .should_skip(&item_error, step_execution.skip_count())
                    {
                        step_execution.write_skip_count += 1;
                        warn!(
                            "Skipping unwritable item in step '{}': {}",
                            self.name, item_error
                        );
                    } else {
                        return Err(item_error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Persists step progress. On an optimistic-lock conflict (a stop thread
    /// raced our update) the stored version is re-read, reconciled and the
    /// update retried once; the terminate-only flag needs no merging because
    /// it is shared between the copies.
    fn persist(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        match repository.update_step_execution(step_execution) {
            Err(BatchError::OptimisticLockingFailure(_)) => {
                let id = step_execution.id().ok_or_else(|| {
                    BatchError::Configuration("step execution lost its id".to_string())
                })?;
                let stored = repository.get_step_execution(id).ok_or_else(|| {
                    BatchError::Configuration(format!("step execution {id} vanished from store"))
                })?;
                debug!(
                    "Reconciling concurrent update of step '{}' (stored version {:?})",
                    self.name,
                    stored.version()
                );
                if let Some(version) = stored.version() {
                    step_execution.entity.set_version(version);
                }
                repository.update_step_execution(step_execution)
            }
            other => other,
        }
    }

    fn log_close_error(result: Result<(), BatchError>) {
        if let Err(error) = result {
            warn!("Non-fatal error while closing a stream: {}", error);
        }
    }
}

/// Builder for [`ChunkOrientedStep`].
///
/// # Example
///
/// ```
/// use batchflow::core::step::StepBuilder;
/// use batchflow::item::{InMemoryItemReader, InMemoryItemWriter};
///
/// let reader = InMemoryItemReader::new("numbers", (0..6).collect());
/// let writer: InMemoryItemWriter<i32> = InMemoryItemWriter::new();
///
/// let step = StepBuilder::new("copy-numbers")
///     .reader(&reader)
///     .writer(&writer)
///     .chunk(4)
///     .build()
///     .unwrap();
/// ```
pub struct StepBuilder<'a, I, O> {
    name: String,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    chunk_size: usize,
    completion_policy: Option<Box<dyn CompletionPolicy>>,
    skip_limit: Option<usize>,
    skip_policy: Option<Box<dyn SkipPolicy>>,
    retry_limit: Option<usize>,
    retry_policy: Option<Box<dyn RetryPolicy>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    properties: StepProperties,
}

impl<'a, I, O> StepBuilder<'a, I, O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reader: None,
            processor: None,
            writer: None,
            chunk_size: 10,
            completion_policy: None,
            skip_limit: None,
            skip_policy: None,
            retry_limit: None,
            retry_policy: None,
            transaction_manager: None,
            properties: StepProperties::default(),
        }
    }

    pub fn reader(mut self, reader: &'a dyn ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a dyn ItemProcessor<I, O>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a dyn ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Commit interval: number of items per chunk.
    pub fn chunk(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Replaces the default item-count policy.
    pub fn completion_policy(mut self, policy: Box<dyn CompletionPolicy>) -> Self {
        self.completion_policy = Some(policy);
        self
    }

    /// Shorthand for a limit-checking skip policy.
    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.skip_limit = Some(skip_limit);
        self
    }

    pub fn skip_policy(mut self, policy: Box<dyn SkipPolicy>) -> Self {
        self.skip_policy = Some(policy);
        self
    }

    /// Shorthand for a simple retry policy with this many attempts.
    pub fn retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn retry_policy(mut self, policy: Box<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn start_limit(mut self, start_limit: usize) -> Self {
        self.properties.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.properties.allow_start_if_complete = allow;
        self
    }

    pub fn save_state(mut self, save_state: bool) -> Self {
        self.properties.save_state = save_state;
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError>
    where
        PassThroughProcessor: ItemProcessor<I, O>,
    {
        static PASS_THROUGH: PassThroughProcessor = PassThroughProcessor;

        let reader = self.reader.ok_or_else(|| {
            BatchError::Configuration(format!("step '{}' has no reader", self.name))
        })?;
        let writer = self.writer.ok_or_else(|| {
            BatchError::Configuration(format!("step '{}' has no writer", self.name))
        })?;

        let completion_policy = self
            .completion_policy
            .unwrap_or_else(|| Box::new(ItemCountCompletionPolicy::new(self.chunk_size)));
        let skip_policy: Box<dyn SkipPolicy> = match (self.skip_policy, self.skip_limit) {
            (Some(policy), _) => policy,
            (None, Some(limit)) => Box::new(LimitCheckingSkipPolicy::new(limit)),
            (None, None) => Box::new(NeverSkipPolicy),
        };
        let retry_policy: Box<dyn RetryPolicy> = match (self.retry_policy, self.retry_limit) {
            (Some(policy), _) => policy,
            (None, Some(limit)) => Box::new(SimpleRetryPolicy::new(limit)),
            (None, None) => Box::new(NeverRetryPolicy),
        };

        Ok(ChunkOrientedStep {
            name: self.name,
            reader,
            processor: self.processor.unwrap_or(&PASS_THROUGH),
            writer,
            completion_policy,
            skip_policy,
            retry_policy,
            transaction_manager: self
                .transaction_manager
                .unwrap_or_else(|| Arc::new(ResourcelessTransactionManager::new())),
            properties: self.properties,
        })
    }
}
