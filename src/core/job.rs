use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{info, warn};

use super::build_name;
use super::execution::{JobExecution, StepExecution};
use super::flow::{
    FlowBuilder, FlowExecutionStatus, FlowExecutor, SimpleFlow, State, StateTransitionComparator,
};
use super::job_parameters::JobParameters;
use super::repository::{JobRepository, RestartPolicy};
use super::status::{BatchStatus, ExitStatus};
use super::step::{Step, StepProperties};
use crate::BatchError;

/// A runnable batch job.
///
/// `run` creates a new execution through the repository (refusing duplicate
/// concurrent runs and illegal restarts), drives the job's flow, and returns
/// the finished execution. A failed or stopped run is still `Ok`: the
/// outcome is carried by the execution's status. `Err` is reserved for
/// launch refusals and broken configuration.
pub trait Job {
    fn name(&self) -> &str;

    fn run(&self) -> Result<JobExecution, BatchError>;
}

/// Flow state wrapping a single step.
///
/// Handling the state delegates to the executor, which owns restart
/// decisions (skip if already complete, start-limit enforcement) and the
/// persistence of the step execution.
pub struct StepState<'a> {
    step: &'a dyn Step,
}

impl<'a> StepState<'a> {
    pub fn new(step: &'a dyn Step) -> Arc<dyn State + 'a> {
        Arc::new(Self { step })
    }
}

impl State for StepState<'_> {
    fn name(&self) -> &str {
        self.step.name()
    }

    fn handle(&self, executor: &dyn FlowExecutor) -> Result<FlowExecutionStatus, BatchError> {
        let exit_status = executor.execute_step(self.step, &self.step.properties())?;
        Ok(FlowExecutionStatus::from(&exit_status))
    }
}

/// The executor handed to flow states while a job runs. Creates and persists
/// step executions, applies restart rules, and honours stop requests between
/// steps.
struct JobFlowExecutor<'a> {
    repository: &'a dyn JobRepository,
    job_execution: Mutex<JobExecution>,
}

impl JobFlowExecutor<'_> {
    /// A stop thread marks the stored execution `Stopping`; running steps see
    /// the shared terminate flag, and this check catches the window between
    /// steps.
    fn stop_requested(&self) -> bool {
        let id = self
            .job_execution
            .lock()
            .expect("job execution lock poisoned")
            .id();
        id.and_then(|id| self.repository.get_job_execution(id))
            .is_some_and(|stored| stored.status == BatchStatus::Stopping)
    }
}

impl FlowExecutor for JobFlowExecutor<'_> {
    fn execute_step(
        &self,
        step: &dyn Step,
        properties: &StepProperties,
    ) -> Result<ExitStatus, BatchError> {
        let instance_id = {
            let execution = self
                .job_execution
                .lock()
                .expect("job execution lock poisoned");
            execution
                .job_instance()
                .id()
                .ok_or_else(|| BatchError::Configuration("job instance has no id".to_string()))?
        };

        let last_attempt = self
            .repository
            .get_last_step_execution(instance_id, step.name());

        if let Some(last) = &last_attempt {
            if last.status == BatchStatus::Completed && !properties.allow_start_if_complete {
                info!(
                    "Step {} already complete for this instance, not re-running",
                    step.name()
                );
                return Ok(last.exit_status.clone());
            }
        }

        let attempts = self
            .repository
            .count_step_executions(instance_id, step.name());
        if attempts >= properties.start_limit {
            return Err(BatchError::StartLimitExceeded(format!(
                "step '{}' reached its start limit of {}",
                step.name(),
                properties.start_limit
            )));
        }

        if self.stop_requested() {
            info!("Stop requested, not starting step {}", step.name());
            return Ok(ExitStatus::stopped());
        }

        let mut step_execution = {
            let mut execution = self
                .job_execution
                .lock()
                .expect("job execution lock poisoned");
            let mut step_execution = StepExecution::new(step.name(), &execution);
            if properties.save_state {
                if let Some(last) = &last_attempt {
                    if last.status != BatchStatus::Completed {
                        // Resume from the position the failed attempt
                        // committed last.
                        step_execution.execution_context = last.execution_context.clone();
                    }
                }
            }
            self.repository.add_step_execution(&mut step_execution)?;
            execution.step_executions.push(step_execution.clone());
            step_execution
        };

        match step.execute(&mut step_execution, self.repository) {
            Ok(()) => Ok(step_execution.exit_status.clone()),
            Err(error) => {
                // The engine already recorded a terminal status; surface it
                // to the flow so transitions can route on it. Anything else
                // is a broken engine or repository and aborts the flow.
                if matches!(
                    step_execution.status,
                    BatchStatus::Failed | BatchStatus::Stopped
                ) {
                    warn!("Step {} did not complete: {}", step.name(), error);
                    Ok(step_execution.exit_status.clone())
                } else {
                    Err(error)
                }
            }
        }
    }
}

/// A job whose steps are organised as a flow graph.
///
/// Holds its collaborators by reference, so the same value can be run
/// repeatedly: a rerun after a failure lands on the same job instance and
/// resumes where the failed run left off.
pub struct FlowJob<'a> {
    name: String,
    flow: SimpleFlow<'a>,
    repository: &'a dyn JobRepository,
    parameters: JobParameters,
    restart_policy: RestartPolicy,
}

impl FlowJob<'_> {
    fn batch_status_of(status: &FlowExecutionStatus) -> BatchStatus {
        if status.is_stop() {
            BatchStatus::Stopped
        } else if status.is_fail() {
            BatchStatus::Failed
        } else if status.name().starts_with("COMPLETED") {
            BatchStatus::Completed
        } else {
            BatchStatus::Unknown
        }
    }

    /// Final persist of the job execution. A concurrent stop request may
    /// have bumped the stored version; adopt it and retry once, keeping our
    /// terminal status.
    fn persist(&self, execution: &mut JobExecution) -> Result<(), BatchError> {
        match self.repository.update_job_execution(execution) {
            Err(BatchError::OptimisticLockingFailure(_)) => {
                let id = execution.id().ok_or_else(|| {
                    BatchError::Configuration("job execution lost its id".to_string())
                })?;
                let stored = self.repository.get_job_execution(id).ok_or_else(|| {
                    BatchError::Configuration(format!("job execution {id} vanished from store"))
                })?;
                if let Some(version) = stored.version() {
                    execution.entity.set_version(version);
                }
                self.repository.update_job_execution(execution)
            }
            other => other,
        }
    }
}

impl Job for FlowJob<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<JobExecution, BatchError> {
        let prior = self
            .repository
            .get_last_job_execution(&self.name, &self.parameters);
        let mut execution = self.repository.create_job_execution(
            &self.name,
            &self.parameters,
            &self.restart_policy,
        )?;
        info!(
            "Start of job: {}, execution id: {:?}",
            self.name,
            execution.id()
        );

        execution.status = BatchStatus::Started;
        execution.start_time = Some(Utc::now());
        self.repository.update_job_execution(&mut execution)?;

        // On a restart, enter the flow at the first step the previous
        // attempt did not complete instead of walking from the start. A step
        // that ran inside a split branch is not a state of this flow; in that
        // case walk from the start and let the executor skip the steps that
        // already completed.
        let resume_state = prior.as_ref().and_then(|previous| {
            previous
                .step_executions
                .iter()
                .find(|step| step.status != BatchStatus::Completed)
                .map(|step| step.step_name().to_string())
                .filter(|name| self.flow.has_state(name))
        });

        let executor = JobFlowExecutor {
            repository: self.repository,
            job_execution: Mutex::new(execution),
        };
        let result = match &resume_state {
            Some(state) => {
                info!("Resuming job {} at step {}", self.name, state);
                self.flow.resume(state, &executor)
            }
            None => self.flow.start(&executor),
        };
        let mut execution = executor
            .job_execution
            .into_inner()
            .expect("job execution lock poisoned");

        execution.end_time = Some(Utc::now());
        match result {
            Ok(flow_execution) => {
                execution.status = Self::batch_status_of(flow_execution.status());
                execution.exit_status = ExitStatus::new(flow_execution.status().name());
            }
            Err(BatchError::JobInterrupted(message)) => {
                execution.status = BatchStatus::Stopped;
                execution.exit_status = ExitStatus::stopped().add_exit_description(&message);
            }
            Err(error) => {
                execution.status = BatchStatus::Failed;
                execution.exit_status =
                    ExitStatus::failed().add_exit_description(&error.to_string());
            }
        }
        self.persist(&mut execution)?;

        info!(
            "End of job: {}, status: {}, exit code: {}",
            self.name,
            execution.status,
            execution.exit_status.exit_code()
        );
        Ok(execution)
    }
}

/// Requests a graceful stop of a running job execution.
///
/// Marks the stored execution `Stopping` and flips the terminate flag of its
/// step executions; the running engine observes the flag at its next chunk
/// boundary. Returns `Ok(false)` when the execution has already reached a
/// terminal status.
pub fn request_stop(
    repository: &dyn JobRepository,
    job_execution_id: i64,
) -> Result<bool, BatchError> {
    // The version check may race the running thread's chunk commit; re-fetch
    // and try again. The terminate flags are shared, so they stay set across
    // attempts.
    for _ in 0..2 {
        let mut execution = repository.get_job_execution(job_execution_id).ok_or_else(|| {
            BatchError::Configuration(format!("no job execution with id {job_execution_id}"))
        })?;
        if !execution.is_running() {
            return Ok(false);
        }
        execution.stop();
        match repository.update_job_execution(&mut execution) {
            Ok(()) => return Ok(true),
            Err(BatchError::OptimisticLockingFailure(_)) => continue,
            Err(error) => return Err(error),
        }
    }
    Err(BatchError::OptimisticLockingFailure(format!(
        "could not mark job execution {job_execution_id} as stopping"
    )))
}

/// Builder for [`FlowJob`].
///
/// Steps added with [`JobBuilder::start`] and [`JobBuilder::next`] are wired
/// into a linear flow: each step advances to the next one on `COMPLETED` and
/// ends the job with its own status on anything else. A hand-built
/// [`SimpleFlow`] can be supplied instead for branching and splits.
///
/// # Example
///
/// ```rust,no_run,compile_fail
/// let job = JobBuilder::new()
///     .name("import-customers".to_string())
///     .repository(&repository)
///     .parameters(parameters)
///     .start(&read_step)
///     .next(&report_step)
///     .build()?;
///
/// let execution = job.run()?;
/// ```
pub struct JobBuilder<'a> {
    name: Option<String>,
    steps: Vec<&'a dyn Step>,
    flow: Option<SimpleFlow<'a>>,
    repository: Option<&'a dyn JobRepository>,
    parameters: JobParameters,
    restart_policy: RestartPolicy,
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: None,
            steps: Vec::new(),
            flow: None,
            repository: None,
            parameters: JobParameters::default(),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Sets the name of the job. A random name is generated if not set.
    pub fn name(mut self, name: String) -> JobBuilder<'a> {
        self.name = Some(name);
        self
    }

    pub fn repository(mut self, repository: &'a dyn JobRepository) -> JobBuilder<'a> {
        self.repository = Some(repository);
        self
    }

    pub fn parameters(mut self, parameters: JobParameters) -> JobBuilder<'a> {
        self.parameters = parameters;
        self
    }

    /// Marks the job as not restartable: any prior execution of the instance
    /// refuses a new run.
    pub fn prevent_restart(mut self) -> JobBuilder<'a> {
        self.restart_policy.restartable = false;
        self
    }

    /// Allows re-running an instance that already completed.
    pub fn restart_if_complete(mut self) -> JobBuilder<'a> {
        self.restart_policy.restart_if_complete = true;
        self
    }

    /// Sets the first step of the job.
    pub fn start(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    /// Adds a step after the previous one. It runs when its predecessor
    /// completes.
    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    /// Replaces the linear step sequence with a hand-built flow.
    pub fn flow(mut self, flow: SimpleFlow<'a>) -> JobBuilder<'a> {
        self.flow = Some(flow);
        self
    }

    pub fn build(self) -> Result<FlowJob<'a>, BatchError> {
        let name = self.name.unwrap_or_else(build_name);
        let repository = self
            .repository
            .ok_or_else(|| BatchError::Configuration(format!("job '{name}' has no repository")))?;

        let flow = match self.flow {
            Some(flow) => {
                if !self.steps.is_empty() {
                    return Err(BatchError::Configuration(format!(
                        "job '{name}' mixes a custom flow with start/next steps"
                    )));
                }
                flow
            }
            None => {
                if self.steps.is_empty() {
                    return Err(BatchError::Configuration(format!(
                        "job '{name}' has no steps"
                    )));
                }
                let mut builder =
                    FlowBuilder::new(&name).comparator(StateTransitionComparator::Specificity);
                for step in &self.steps {
                    builder = builder.state(StepState::new(*step));
                }
                for pair in self.steps.windows(2) {
                    builder =
                        builder.transition(pair[0].name(), Some("COMPLETED"), pair[1].name());
                }
                // Any other status ends the job with that status.
                for step in &self.steps {
                    builder = builder.end(step.name(), None);
                }
                builder.build()?
            }
        };

        Ok(FlowJob {
            name,
            flow,
            repository,
            parameters: self.parameters,
            restart_policy: self.restart_policy,
        })
    }
}

impl Default for JobBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}
