use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::Entity;
use super::job_parameters::JobParameters;
use super::status::{BatchStatus, ExitStatus};

/// Keyed bag of serializable values scoped to a job or step execution.
///
/// The chunk engine records its resume position here (for example the last
/// successfully read offset); the context is persisted atomically with its
/// owning execution at every chunk commit, which is what makes a restart
/// pick up where the last committed chunk left off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn put_i64(&mut self, key: &str, value: i64) {
        self.put(key, Value::from(value));
    }

    pub fn put_f64(&mut self, key: &str, value: f64) {
        self.put(key, Value::from(value));
    }

    pub fn put_string(&mut self, key: &str, value: &str) {
        self.put(key, Value::from(value));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(Value::as_f64)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One logical job identity: a job name plus the identifying-parameter hash.
/// Created once per distinct parameter set and immutable thereafter.
#[derive(Debug, Clone)]
pub struct JobInstance {
    entity: Entity,
    job_name: String,
    job_key: String,
}

impl JobInstance {
    pub fn new(job_name: &str, parameters: &JobParameters) -> Self {
        Self {
            entity: Entity::new(),
            job_name: job_name.to_string(),
            job_key: parameters.identifying_key(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.entity.id()
    }

    pub fn entity_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }
}

impl PartialEq for JobInstance {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

/// One attempt to run a job instance.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub(crate) entity: Entity,
    job_instance: JobInstance,
    parameters: JobParameters,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub execution_context: ExecutionContext,
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn new(job_instance: JobInstance, parameters: JobParameters) -> Self {
        Self {
            entity: Entity::new(),
            job_instance,
            parameters,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.entity.id()
    }

    pub fn version(&self) -> Option<i32> {
        self.entity.version()
    }

    pub fn job_instance(&self) -> &JobInstance {
        &self.job_instance
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Requests a graceful stop: flips the terminate-only flag of every step
    /// execution attached to this execution. Running steps observe the flag
    /// at their next chunk boundary.
    pub fn stop(&mut self) {
        self.status = BatchStatus::Stopping;
        for step_execution in &self.step_executions {
            step_execution.set_terminate_only();
        }
    }
}

impl PartialEq for JobExecution {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

/// One attempt to run a named step within a job execution.
///
/// Counters are updated by the chunk engine and persisted after every
/// committed chunk, never deleted, so a crashed run leaves an accurate
/// record of how far it got.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub(crate) entity: Entity,
    step_name: String,
    job_execution_id: Option<i64>,
    job_instance_id: Option<i64>,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: usize,
    pub write_count: usize,
    pub filter_count: usize,
    pub commit_count: usize,
    pub rollback_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    // Shared across clones so a stop thread holding a copy fetched from the
    // repository reaches the running engine between chunks.
    terminate_only: Arc<AtomicBool>,
}

impl StepExecution {
    pub fn new(step_name: &str, job_execution: &JobExecution) -> Self {
        Self {
            entity: Entity::new(),
            step_name: step_name.to_string(),
            job_execution_id: job_execution.id(),
            job_instance_id: job_execution.job_instance().id(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: None,
            end_time: None,
            execution_context: ExecutionContext::new(),
            terminate_only: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.entity.id()
    }

    pub fn version(&self) -> Option<i32> {
        self.entity.version()
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn job_execution_id(&self) -> Option<i64> {
        self.job_execution_id
    }

    pub fn job_instance_id(&self) -> Option<i64> {
        self.job_instance_id
    }

    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Asks the running step to terminate at its next chunk boundary.
    pub fn set_terminate_only(&self) {
        self.terminate_only.store(true, Ordering::SeqCst);
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only.load(Ordering::SeqCst)
    }
}

impl PartialEq for StepExecution {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}
