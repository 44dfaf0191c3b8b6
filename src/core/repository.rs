use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use log::debug;

use super::execution::{JobExecution, JobInstance, StepExecution};
use super::flow::matches_pattern;
use super::job_parameters::JobParameters;
use super::status::BatchStatus;
use crate::BatchError;

/// Restart rules applied when a new job execution is created, passed
/// explicitly by the job driver instead of being resolved from ambient
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// When false, any prior execution of the instance refuses a new one.
    pub restartable: bool,
    /// When true, a completed instance may be run again.
    pub restart_if_complete: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restartable: true,
            restart_if_complete: false,
        }
    }
}

/// Persistence contract for execution metadata.
///
/// Implementations must enforce two invariants:
/// - at most one non-terminal execution per job instance;
/// - `update` refuses a write whose version no longer matches the stored
///   version (`OptimisticLockingFailure`), never silently overwriting. The
///   version check is the sole serialization mechanism between the running
///   thread and concurrent stop requests.
pub trait JobRepository: Send + Sync {
    /// Creates a new execution in `Starting` status, creating or reusing the
    /// job instance for `(job_name, identifying parameters)`.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        policy: &RestartPolicy,
    ) -> Result<JobExecution, BatchError>;

    /// Persists the in-memory state of the execution, bumping its version.
    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;

    /// Assigns an id to a fresh step execution and stores it.
    fn add_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    /// Persists step progress; called at every chunk commit boundary so
    /// partial progress survives a crash.
    fn update_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    fn get_job_execution(&self, id: i64) -> Option<JobExecution>;

    fn get_step_execution(&self, id: i64) -> Option<StepExecution>;

    /// Most recent execution for the instance identified by the job name and
    /// identifying parameters, with its step executions attached.
    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Option<JobExecution>;

    /// All executions of the instance, oldest first.
    fn get_job_executions(&self, job_instance_id: i64) -> Vec<JobExecution>;

    /// Executions of the named job that are not in a terminal status.
    fn find_running_executions(&self, job_name: &str) -> Vec<JobExecution>;

    /// Instances whose job name matches a `*`/`?` glob, for operational
    /// tooling.
    fn find_job_instances(&self, name_pattern: &str) -> Vec<JobInstance>;

    /// Most recent attempt of the named step across all executions of the
    /// instance.
    fn get_last_step_execution(
        &self,
        job_instance_id: i64,
        step_name: &str,
    ) -> Option<StepExecution>;

    /// Number of attempts of the named step across all executions of the
    /// instance, used for start-limit enforcement.
    fn count_step_executions(&self, job_instance_id: i64, step_name: &str) -> usize;
}

#[derive(Default)]
struct Store {
    instances: Vec<JobInstance>,
    executions: HashMap<i64, JobExecution>,
    step_executions: HashMap<i64, StepExecution>,
}

/// In-memory [`JobRepository`].
///
/// Keeps the four logical record sets (instances, job executions, step
/// executions, execution contexts) in mutex-guarded maps with monotonic
/// per-record-type id sequences. Durable stores plug in behind the same
/// trait.
#[derive(Default)]
pub struct InMemoryJobRepository {
    store: Mutex<Store>,
    instance_seq: AtomicI64,
    execution_seq: AtomicI64,
    step_execution_seq: AtomicI64,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(sequence: &AtomicI64) -> i64 {
        sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Re-attaches the step executions belonging to a stored execution,
    /// oldest first.
    fn with_steps(store: &Store, mut execution: JobExecution) -> JobExecution {
        let mut steps: Vec<StepExecution> = store
            .step_executions
            .values()
            .filter(|step| step.job_execution_id() == execution.id())
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.id());
        execution.step_executions = steps;
        execution
    }

    fn executions_of_instance(store: &Store, instance_id: i64) -> Vec<JobExecution> {
        let mut executions: Vec<JobExecution> = store
            .executions
            .values()
            .filter(|execution| execution.job_instance().id() == Some(instance_id))
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.id());
        executions
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        policy: &RestartPolicy,
    ) -> Result<JobExecution, BatchError> {
        let mut store = self.store.lock().expect("repository lock poisoned");

        let job_key = parameters.identifying_key();
        let existing = store
            .instances
            .iter()
            .find(|instance| instance.job_name() == job_name && instance.job_key() == job_key)
            .cloned();

        let (instance, inherited_context) = match existing {
            Some(instance) => {
                let instance_id = instance.id().expect("stored instance always has an id");
                let executions = Self::executions_of_instance(&store, instance_id);

                if executions.iter().any(JobExecution::is_running) {
                    return Err(BatchError::JobExecutionAlreadyRunning(job_name.to_string()));
                }
                if !policy.restartable && !executions.is_empty() {
                    return Err(BatchError::JobRestart(job_name.to_string()));
                }
                if let Some(last) = executions.last() {
                    if last.status == BatchStatus::Abandoned {
                        return Err(BatchError::JobRestart(format!(
                            "{job_name}: last execution was abandoned"
                        )));
                    }
                    if last.status == BatchStatus::Completed && !policy.restart_if_complete {
                        return Err(BatchError::JobInstanceAlreadyComplete(job_name.to_string()));
                    }
                }
                // A restart carries the job-level context of the previous
                // execution forward.
                let context = executions
                    .last()
                    .map(|last| last.execution_context.clone());
                (instance, context)
            }
            None => {
                let mut instance = JobInstance::new(job_name, parameters);
                instance
                    .entity_mut()
                    .assign_id(Self::next_id(&self.instance_seq));
                instance.entity_mut().increment_version();
                store.instances.push(instance.clone());
                debug!("Created job instance: {} ({})", job_name, job_key);
                (instance, None)
            }
        };

        let mut execution = JobExecution::new(instance, parameters.clone());
        if let Some(context) = inherited_context {
            execution.execution_context = context;
        }
        execution
            .entity
            .assign_id(Self::next_id(&self.execution_seq));
        execution.entity.increment_version();
        store
            .executions
            .insert(execution.id().expect("id just assigned"), execution.clone());
        Ok(execution)
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        let id = job_execution.id().ok_or_else(|| {
            BatchError::Configuration("cannot update an unsaved job execution".to_string())
        })?;
        let stored = store.executions.get_mut(&id).ok_or_else(|| {
            BatchError::Configuration(format!("no stored job execution with id {id}"))
        })?;

        if stored.version() != job_execution.version() {
            return Err(BatchError::OptimisticLockingFailure(format!(
                "job execution {id}: stored version {:?}, attempted {:?}",
                stored.version(),
                job_execution.version()
            )));
        }

        job_execution.entity.increment_version();
        let mut snapshot = job_execution.clone();
        snapshot.step_executions = Vec::new();
        *stored = snapshot;
        Ok(())
    }

    fn add_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        if step_execution.job_execution_id().is_none() {
            return Err(BatchError::Configuration(
                "step execution is not attached to a saved job execution".to_string(),
            ));
        }
        step_execution
            .entity
            .assign_id(Self::next_id(&self.step_execution_seq));
        step_execution.entity.increment_version();
        store.step_executions.insert(
            step_execution.id().expect("id just assigned"),
            step_execution.clone(),
        );
        Ok(())
    }

    fn update_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        let id = step_execution.id().ok_or_else(|| {
            BatchError::Configuration("cannot update an unsaved step execution".to_string())
        })?;
        let stored = store.step_executions.get_mut(&id).ok_or_else(|| {
            BatchError::Configuration(format!("no stored step execution with id {id}"))
        })?;

        if stored.version() != step_execution.version() {
            return Err(BatchError::OptimisticLockingFailure(format!(
                "step execution {id} ({}): stored version {:?}, attempted {:?}",
                step_execution.step_name(),
                stored.version(),
                step_execution.version()
            )));
        }

        step_execution.entity.increment_version();
        *stored = step_execution.clone();
        Ok(())
    }

    fn get_job_execution(&self, id: i64) -> Option<JobExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        store
            .executions
            .get(&id)
            .cloned()
            .map(|execution| Self::with_steps(&store, execution))
    }

    fn get_step_execution(&self, id: i64) -> Option<StepExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        store.step_executions.get(&id).cloned()
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Option<JobExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        let job_key = parameters.identifying_key();
        let instance_id = store
            .instances
            .iter()
            .find(|instance| instance.job_name() == job_name && instance.job_key() == job_key)
            .and_then(JobInstance::id)?;
        Self::executions_of_instance(&store, instance_id)
            .pop()
            .map(|execution| Self::with_steps(&store, execution))
    }

    fn get_job_executions(&self, job_instance_id: i64) -> Vec<JobExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        Self::executions_of_instance(&store, job_instance_id)
            .into_iter()
            .map(|execution| Self::with_steps(&store, execution))
            .collect()
    }

    fn find_running_executions(&self, job_name: &str) -> Vec<JobExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        let mut running: Vec<JobExecution> = store
            .executions
            .values()
            .filter(|execution| {
                execution.job_instance().job_name() == job_name && execution.is_running()
            })
            .cloned()
            .map(|execution| Self::with_steps(&store, execution))
            .collect();
        running.sort_by_key(|execution| execution.id());
        running
    }

    fn find_job_instances(&self, name_pattern: &str) -> Vec<JobInstance> {
        let store = self.store.lock().expect("repository lock poisoned");
        store
            .instances
            .iter()
            .filter(|instance| matches_pattern(name_pattern, instance.job_name()))
            .cloned()
            .collect()
    }

    fn get_last_step_execution(
        &self,
        job_instance_id: i64,
        step_name: &str,
    ) -> Option<StepExecution> {
        let store = self.store.lock().expect("repository lock poisoned");
        let execution_ids: Vec<i64> = Self::executions_of_instance(&store, job_instance_id)
            .iter()
            .filter_map(JobExecution::id)
            .collect();
        store
            .step_executions
            .values()
            .filter(|step| {
                step.step_name() == step_name
                    && step
                        .job_execution_id()
                        .is_some_and(|id| execution_ids.contains(&id))
            })
            .max_by_key(|step| step.id())
            .cloned()
    }

    fn count_step_executions(&self, job_instance_id: i64, step_name: &str) -> usize {
        let store = self.store.lock().expect("repository lock poisoned");
        let execution_ids: Vec<i64> = Self::executions_of_instance(&store, job_instance_id)
            .iter()
            .filter_map(JobExecution::id)
            .collect();
        store
            .step_executions
            .values()
            .filter(|step| {
                step.step_name() == step_name
                    && step
                        .job_execution_id()
                        .is_some_and(|id| execution_ids.contains(&id))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::core::job_parameters::JobParametersBuilder;
    use crate::core::status::ExitStatus;

    fn parameters(seq: i64) -> JobParameters {
        JobParametersBuilder::new().add_long("seq", seq).build()
    }

    fn finish(
        repository: &InMemoryJobRepository,
        execution: &mut JobExecution,
        status: BatchStatus,
    ) {
        execution.status = status;
        execution.exit_status = ExitStatus::from(status);
        execution.end_time = Some(Utc::now());
        repository.update_job_execution(execution).unwrap();
    }

    #[test]
    fn distinct_parameters_create_distinct_instances() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut first = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        finish(&repository, &mut first, BatchStatus::Completed);

        let second = repository
            .create_job_execution("import", &parameters(2), &policy)
            .unwrap();

        assert_ne!(
            first.job_instance().id(),
            second.job_instance().id()
        );
    }

    #[test]
    fn running_instance_refuses_a_second_execution() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        let result = repository.create_job_execution("import", &parameters(1), &policy);

        assert!(matches!(
            result,
            Err(BatchError::JobExecutionAlreadyRunning(_))
        ));
    }

    #[test]
    fn completed_instance_refuses_restart_unless_allowed() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut execution = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        finish(&repository, &mut execution, BatchStatus::Completed);

        let result = repository.create_job_execution("import", &parameters(1), &policy);
        assert!(matches!(
            result,
            Err(BatchError::JobInstanceAlreadyComplete(_))
        ));

        let lenient = RestartPolicy {
            restart_if_complete: true,
            ..RestartPolicy::default()
        };
        assert!(
            repository
                .create_job_execution("import", &parameters(1), &lenient)
                .is_ok()
        );
    }

    #[test]
    fn failed_instance_restarts_on_the_same_instance() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut execution = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        finish(&repository, &mut execution, BatchStatus::Failed);

        let restarted = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        assert_eq!(
            restarted.job_instance().id(),
            execution.job_instance().id()
        );
        assert_ne!(restarted.id(), execution.id());
    }

    #[test]
    fn restarted_execution_inherits_the_job_level_context() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut execution = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        execution
            .execution_context
            .put_i64("import.watermark", 42);
        finish(&repository, &mut execution, BatchStatus::Failed);

        let restarted = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        assert_eq!(
            restarted.execution_context.get_i64("import.watermark"),
            Some(42)
        );
    }

    #[test]
    fn non_restartable_job_refuses_any_second_execution() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy {
            restartable: false,
            ..RestartPolicy::default()
        };

        let mut execution = repository
            .create_job_execution("once", &parameters(1), &policy)
            .unwrap();
        finish(&repository, &mut execution, BatchStatus::Failed);

        let result = repository.create_job_execution("once", &parameters(1), &policy);
        assert!(matches!(result, Err(BatchError::JobRestart(_))));
    }

    #[test]
    fn abandoned_execution_blocks_restart() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut execution = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        finish(&repository, &mut execution, BatchStatus::Abandoned);

        let result = repository.create_job_execution("import", &parameters(1), &policy);
        assert!(matches!(result, Err(BatchError::JobRestart(_))));
    }

    #[test]
    fn stale_version_update_fails_exactly_once() {
        let repository = InMemoryJobRepository::new();
        let execution = repository
            .create_job_execution("import", &parameters(1), &RestartPolicy::default())
            .unwrap();

        let mut step_execution = StepExecution::new("load", &execution);
        repository.add_step_execution(&mut step_execution).unwrap();

        let mut stale = step_execution.clone();
        step_execution.read_count = 10;
        repository.update_step_execution(&mut step_execution).unwrap();

        stale.set_terminate_only();
        let result = repository.update_step_execution(&mut stale);
        assert!(matches!(
            result,
            Err(BatchError::OptimisticLockingFailure(_))
        ));

        // The winning write is intact.
        let stored = repository.get_step_execution(step_execution.id().unwrap());
        assert_eq!(stored.unwrap().read_count, 10);
    }

    #[test]
    fn step_progress_is_visible_through_the_last_execution() {
        let repository = InMemoryJobRepository::new();
        let execution = repository
            .create_job_execution("import", &parameters(1), &RestartPolicy::default())
            .unwrap();

        let mut first = StepExecution::new("load", &execution);
        repository.add_step_execution(&mut first).unwrap();
        let mut second = StepExecution::new("report", &execution);
        repository.add_step_execution(&mut second).unwrap();

        let last = repository
            .get_last_job_execution("import", &parameters(1))
            .unwrap();
        let names: Vec<&str> = last
            .step_executions
            .iter()
            .map(StepExecution::step_name)
            .collect();
        assert_eq!(names, vec!["load", "report"]);
    }

    #[test]
    fn instances_are_searchable_by_glob() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();
        for name in ["import-trades", "import-fees", "export-trades"] {
            repository
                .create_job_execution(name, &parameters(1), &policy)
                .unwrap();
        }

        assert_eq!(repository.find_job_instances("import-*").len(), 2);
        assert_eq!(repository.find_job_instances("*-trades").len(), 2);
        assert_eq!(repository.find_job_instances("*port*").len(), 3);
        assert_eq!(repository.find_job_instances("nope").len(), 0);
    }

    #[test]
    fn step_attempts_are_counted_across_executions() {
        let repository = InMemoryJobRepository::new();
        let policy = RestartPolicy::default();

        let mut execution = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        let mut attempt = StepExecution::new("load", &execution);
        repository.add_step_execution(&mut attempt).unwrap();
        finish(&repository, &mut execution, BatchStatus::Failed);

        let restarted = repository
            .create_job_execution("import", &parameters(1), &policy)
            .unwrap();
        let mut retry = StepExecution::new("load", &restarted);
        repository.add_step_execution(&mut retry).unwrap();

        let instance_id = restarted.job_instance().id().unwrap();
        assert_eq!(repository.count_step_executions(instance_id, "load"), 2);
        assert_eq!(
            repository
                .get_last_step_execution(instance_id, "load")
                .unwrap()
                .id(),
            retry.id()
        );
    }
}
