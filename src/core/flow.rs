use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use super::status::ExitStatus;
use super::step::{Step, StepProperties};
use crate::BatchError;

/// Anchored full-string glob match: `?` matches one character, `*` any run
/// of characters. An empty pattern matches any value, which is how an
/// unqualified transition catches every exit status.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    glob_match(&pattern, &value)
}

fn glob_match(pattern: &[char], value: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('*', rest)) => (0..=value.len()).any(|skip| glob_match(rest, &value[skip..])),
        Some(('?', rest)) => !value.is_empty() && glob_match(rest, &value[1..]),
        Some((expected, rest)) => {
            value.first() == Some(expected) && glob_match(rest, &value[1..])
        }
    }
}

/// Status produced by a state, wrapping an exit-status-like name.
///
/// Ordering is by terminal bucket first (`COMPLETED < FAILED < UNKNOWN`,
/// where a name belongs to the bucket it starts with and anything
/// unrecognized lands in the `UNKNOWN` bucket), then lexicographically.
/// The ordering is used when aggregating branch statuses and by the
/// status-severity transition comparator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExecutionStatus {
    name: String,
}

impl FlowExecutionStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn completed() -> Self {
        Self::new("COMPLETED")
    }

    pub fn failed() -> Self {
        Self::new("FAILED")
    }

    pub fn stopped() -> Self {
        Self::new("STOPPED")
    }

    pub fn unknown() -> Self {
        Self::new("UNKNOWN")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stop(&self) -> bool {
        self.name.starts_with("STOPPED")
    }

    pub fn is_fail(&self) -> bool {
        self.name.starts_with("FAILED")
    }

    fn bucket(&self) -> u8 {
        if self.name.starts_with("COMPLETED") {
            0
        } else if self.name.starts_with("FAILED") {
            1
        } else {
            2
        }
    }
}

impl From<&ExitStatus> for FlowExecutionStatus {
    fn from(exit_status: &ExitStatus) -> Self {
        Self::new(exit_status.exit_code())
    }
}

impl Ord for FlowExecutionStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bucket()
            .cmp(&other.bucket())
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for FlowExecutionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FlowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Terminal result of one flow run: the name of the last state handled and
/// the status it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowExecution {
    name: String,
    status: FlowExecutionStatus,
}

impl FlowExecution {
    pub fn new(name: &str, status: FlowExecutionStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &FlowExecutionStatus {
        &self.status
    }
}

impl Ord for FlowExecution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.status.cmp(&other.status)
    }
}

impl PartialOrd for FlowExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Boundary through which states reach the rest of the engine. The job
/// driver supplies the real implementation, which creates step executions
/// through the repository and runs the step.
pub trait FlowExecutor: Sync {
    fn execute_step(
        &self,
        step: &dyn Step,
        properties: &StepProperties,
    ) -> Result<ExitStatus, BatchError>;
}

/// A named node of the flow graph.
pub trait State: Send + Sync {
    fn name(&self) -> &str;

    /// Executes the state and reports a status for transition matching.
    fn handle(&self, executor: &dyn FlowExecutor) -> Result<FlowExecutionStatus, BatchError>;
}

/// One outgoing edge of a state: an exit-status pattern and the name of the
/// next state, or no next state for an end transition that terminates the
/// flow with the current status.
#[derive(Debug, Clone)]
pub struct StateTransition {
    state_name: String,
    pattern: Option<String>,
    next: Option<String>,
}

impl StateTransition {
    pub fn new(state_name: &str, pattern: Option<&str>, next: &str) -> Self {
        Self {
            state_name: state_name.to_string(),
            pattern: pattern.map(str::to_string),
            next: Some(next.to_string()),
        }
    }

    pub fn new_end(state_name: &str, pattern: Option<&str>) -> Self {
        Self {
            state_name: state_name.to_string(),
            pattern: pattern.map(str::to_string),
            next: None,
        }
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn is_end(&self) -> bool {
        self.next.is_none()
    }

    pub fn matches(&self, status: &str) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => matches_pattern(pattern, status),
        }
    }

    fn wildcard_counts(&self) -> (usize, usize) {
        match &self.pattern {
            None => (usize::MAX, usize::MAX),
            Some(pattern) => (
                pattern.matches('*').count(),
                pattern.matches('?').count(),
            ),
        }
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateTransition: [state={}, pattern={}, next={}]",
            self.state_name,
            self.pattern.as_deref().unwrap_or("*"),
            self.next.as_deref().unwrap_or("(end)")
        )
    }
}

/// Tie-break rule when several transitions of one state match the same
/// status. Pluggable policy, not a hard-coded law.
#[derive(Debug, Clone, Copy, Default)]
pub enum StateTransitionComparator {
    /// Ascending wildcard count then target-state name, so the most
    /// specific (least wildcarded) pattern wins.
    #[default]
    Specificity,
    /// Orders the patterns as [`FlowExecutionStatus`] values: severity
    /// bucket first, alphabetical within a bucket.
    StatusSeverity,
}

impl StateTransitionComparator {
    pub fn compare(&self, left: &StateTransition, right: &StateTransition) -> Ordering {
        match self {
            StateTransitionComparator::Specificity => left
                .wildcard_counts()
                .cmp(&right.wildcard_counts())
                .then_with(|| {
                    left.next
                        .as_deref()
                        .unwrap_or("")
                        .cmp(right.next.as_deref().unwrap_or(""))
                }),
            StateTransitionComparator::StatusSeverity => {
                let left = FlowExecutionStatus::new(left.pattern.as_deref().unwrap_or("*"));
                let right = FlowExecutionStatus::new(right.pattern.as_deref().unwrap_or("*"));
                left.cmp(&right)
            }
        }
    }
}

/// Pattern-matched directed graph of named states.
///
/// The first registered state is the start state; [`SimpleFlow::resume`]
/// enters directly at a named state, which is how a restarted job skips its
/// already-completed steps. Construction validates the graph and fails fast
/// on configuration errors, never at run time.
pub struct SimpleFlow<'a> {
    name: String,
    states: HashMap<String, Arc<dyn State + 'a>>,
    start_state: String,
    transitions: Vec<StateTransition>,
    comparator: StateTransitionComparator,
}

impl<'a> SimpleFlow<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this flow directly owns a state with the given name. States of
    /// nested split branches are not visible here.
    pub fn has_state(&self, state_name: &str) -> bool {
        self.states.contains_key(state_name)
    }

    pub fn start(&self, executor: &dyn FlowExecutor) -> Result<FlowExecution, BatchError> {
        self.resume(self.start_state.as_str(), executor)
    }

    pub fn resume(
        &self,
        state_name: &str,
        executor: &dyn FlowExecutor,
    ) -> Result<FlowExecution, BatchError> {
        let mut state = self.states.get(state_name).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "no state named '{state_name}' in flow '{}'",
                self.name
            ))
        })?;

        loop {
            debug!("Flow '{}' handling state: {}", self.name, state.name());
            let status = state.handle(executor)?;
            let transition = self.next_transition(state.name(), &status)?;
            match transition.next() {
                None => {
                    debug!(
                        "Flow '{}' ended at state {} with status {}",
                        self.name,
                        state.name(),
                        status
                    );
                    return Ok(FlowExecution::new(state.name(), status));
                }
                Some(next) => {
                    // Validated at build time, so the lookup cannot miss.
                    state = self.states.get(next).ok_or_else(|| {
                        BatchError::FlowExecution(format!(
                            "next state not found in flow '{}': '{next}'",
                            self.name
                        ))
                    })?;
                }
            }
        }
    }

    /// Selects the winning transition out of a state for the given status:
    /// all matching edges are collected and the configured comparator breaks
    /// overlaps; no match at all fails the flow.
    fn next_transition(
        &self,
        state_name: &str,
        status: &FlowExecutionStatus,
    ) -> Result<&StateTransition, BatchError> {
        let mut matching: Vec<&StateTransition> = self
            .transitions
            .iter()
            .filter(|transition| {
                transition.state_name() == state_name && transition.matches(status.name())
            })
            .collect();

        if matching.is_empty() {
            return Err(BatchError::FlowExecution(format!(
                "next state not found in flow '{}' for state '{state_name}' with exit status '{status}'",
                self.name
            )));
        }

        matching.sort_by(|left, right| self.comparator.compare(left, right));
        Ok(matching[0])
    }
}

/// Builder for [`SimpleFlow`]. States are registered in order (the first one
/// is the start state) and wired with [`FlowBuilder::transition`] /
/// [`FlowBuilder::end`] edges.
pub struct FlowBuilder<'a> {
    name: String,
    states: HashMap<String, Arc<dyn State + 'a>>,
    start_state: Option<String>,
    transitions: Vec<StateTransition>,
    comparator: StateTransitionComparator,
}

impl<'a> FlowBuilder<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: HashMap::new(),
            start_state: None,
            transitions: Vec::new(),
            comparator: StateTransitionComparator::default(),
        }
    }

    pub fn state(mut self, state: Arc<dyn State + 'a>) -> Self {
        if self.start_state.is_none() {
            self.start_state = Some(state.name().to_string());
        }
        self.states.insert(state.name().to_string(), state);
        self
    }

    /// Adds an edge `from --pattern--> to`. A `None` pattern matches any
    /// status.
    pub fn transition(mut self, from: &str, pattern: Option<&str>, to: &str) -> Self {
        self.transitions.push(StateTransition::new(from, pattern, to));
        self
    }

    /// Adds an end edge: when it wins, the flow terminates with the current
    /// status.
    pub fn end(mut self, from: &str, pattern: Option<&str>) -> Self {
        self.transitions.push(StateTransition::new_end(from, pattern));
        self
    }

    pub fn comparator(mut self, comparator: StateTransitionComparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn build(self) -> Result<SimpleFlow<'a>, BatchError> {
        if self.transitions.is_empty() {
            return Err(BatchError::Configuration(format!(
                "flow '{}' has no state transitions",
                self.name
            )));
        }
        let start_state = self.start_state.ok_or_else(|| {
            BatchError::Configuration(format!("flow '{}' has no states", self.name))
        })?;

        for transition in &self.transitions {
            if !self.states.contains_key(transition.state_name()) {
                return Err(BatchError::Configuration(format!(
                    "flow '{}': transition references unknown state '{}'",
                    self.name,
                    transition.state_name()
                )));
            }
            if let Some(next) = transition.next() {
                if !self.states.contains_key(next) {
                    return Err(BatchError::Configuration(format!(
                        "flow '{}': next state '{next}' does not resolve to a state",
                        self.name
                    )));
                }
            }
        }

        // An end transition must be reachable from the start state,
        // otherwise the flow can never terminate.
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start_state.as_str()]);
        let mut end_reachable = false;
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for transition in self
                .transitions
                .iter()
                .filter(|transition| transition.state_name() == current)
            {
                match transition.next() {
                    None => end_reachable = true,
                    Some(next) => queue.push_back(next),
                }
            }
        }
        if !end_reachable {
            return Err(BatchError::Configuration(format!(
                "flow '{}': no end transition is reachable from start state '{start_state}'",
                self.name
            )));
        }

        Ok(SimpleFlow {
            name: self.name,
            states: self.states,
            start_state,
            transitions: self.transitions,
            comparator: self.comparator,
        })
    }
}

/// State fanning out several sub-flows onto worker threads. Each branch
/// drives its own disjoint step executions through the shared executor; the
/// aggregate status is the most severe branch status, computed only after
/// every branch has reached a terminal status.
pub struct SplitState<'a> {
    name: String,
    flows: Vec<SimpleFlow<'a>>,
}

impl<'a> SplitState<'a> {
    pub fn new(name: &str, flows: Vec<SimpleFlow<'a>>) -> Self {
        Self {
            name: name.to_string(),
            flows,
        }
    }
}

impl State for SplitState<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, executor: &dyn FlowExecutor) -> Result<FlowExecutionStatus, BatchError> {
        let results: Vec<Result<FlowExecution, BatchError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .flows
                .iter()
                .map(|flow| scope.spawn(move || flow.start(executor)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(BatchError::FlowExecution(format!(
                            "split '{}': branch thread panicked",
                            self.name
                        )))
                    })
                })
                .collect()
        });

        let mut aggregate = FlowExecutionStatus::completed();
        for result in results {
            let execution = result?;
            aggregate = std::cmp::max(aggregate, execution.status().clone());
        }
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    impl FlowExecutor for NoopExecutor {
        fn execute_step(
            &self,
            _step: &dyn Step,
            _properties: &StepProperties,
        ) -> Result<ExitStatus, BatchError> {
            Ok(ExitStatus::completed())
        }
    }

    struct StubState {
        name: String,
        status: FlowExecutionStatus,
    }

    impl StubState {
        fn new(name: &str) -> Arc<dyn State> {
            Arc::new(Self {
                name: name.to_string(),
                status: FlowExecutionStatus::completed(),
            })
        }

        fn with_status(name: &str, status: FlowExecutionStatus) -> Arc<dyn State> {
            Arc::new(Self {
                name: name.to_string(),
                status,
            })
        }
    }

    impl State for StubState {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&self, _executor: &dyn FlowExecutor) -> Result<FlowExecutionStatus, BatchError> {
            Ok(self.status.clone())
        }
    }

    #[test]
    fn star_matches_any_status() {
        assert!(matches_pattern("*", "CONTINUABLE"));
        assert!(matches_pattern("*", ""));
    }

    #[test]
    fn empty_pattern_matches_any_status() {
        assert!(matches_pattern("", "CONTINUABLE"));
    }

    #[test]
    fn wildcard_patterns_anchor_to_the_full_string() {
        assert!(matches_pattern("CONTIN*", "CONTINUABLE"));
        assert!(matches_pattern("CONTIN???LE", "CONTINUABLE"));
        assert!(matches_pattern("*ABLE", "CONTINUABLE"));
        assert!(!matches_pattern("CONTIN", "CONTINUABLE"));
        assert!(!matches_pattern("CONTIN?LE", "CONTINUABLE"));
    }

    #[test]
    fn transition_matching() {
        let transition = StateTransition::new("state1", Some("CONTIN*"), "start");
        assert!(transition.matches("CONTINUABLE"));
        assert!(!transition.matches("FAILED"));

        let any = StateTransition::new("state1", None, "start");
        assert!(any.matches("CONTINUABLE"));

        let end = StateTransition::new_end("state1", Some(""));
        assert!(end.is_end());
        assert!(end.next().is_none());
        assert!(end.matches("CONTINUABLE"));
    }

    #[test]
    fn status_ordering_follows_buckets_then_alphabet() {
        let completed = FlowExecutionStatus::completed();
        let failed = FlowExecutionStatus::failed();
        let unknown = FlowExecutionStatus::unknown();
        assert!(completed < failed);
        assert!(failed < unknown);

        assert!(FlowExecutionStatus::new("COMPLETED.BAR") < FlowExecutionStatus::new("COMPLETED.FOO"));
        assert!(FlowExecutionStatus::new("COMPLETED.BAR") < FlowExecutionStatus::new("FAILED.FOO"));
        // Unrecognized names land in the last bucket, after any bucketed name.
        assert!(FlowExecutionStatus::new("ZZZZZ") > FlowExecutionStatus::new("FAILED.FOO"));
    }

    #[test]
    fn flow_execution_orders_by_status() {
        let first = FlowExecution::new("foo", FlowExecutionStatus::new("BAR"));
        let second = FlowExecution::new("foo", FlowExecutionStatus::new("SPAM"));
        assert!(first < second);

        let completed = FlowExecution::new("foo", FlowExecutionStatus::completed());
        let failed = FlowExecution::new("foo", FlowExecutionStatus::failed());
        assert!(completed < failed);
    }

    #[test]
    fn empty_transition_set_is_a_configuration_error() {
        let result = FlowBuilder::new("job").state(StubState::new("step")).build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn unresolved_next_state_is_a_configuration_error() {
        let result = FlowBuilder::new("job")
            .state(StubState::new("step"))
            .transition("step", None, "missing")
            .build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn flow_without_reachable_end_is_a_configuration_error() {
        let result = FlowBuilder::new("job")
            .state(StubState::new("step"))
            .transition("step", Some("FAILED"), "step")
            .build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn one_state_flow_completes_with_that_state_name() {
        let flow = FlowBuilder::new("job")
            .state(StubState::new("step1"))
            .end("step1", None)
            .build()
            .unwrap();

        let execution = flow.start(&NoopExecutor).unwrap();
        assert_eq!(execution.status(), &FlowExecutionStatus::completed());
        assert_eq!(execution.name(), "step1");
    }

    #[test]
    fn two_state_flow_walks_the_chain() {
        let flow = FlowBuilder::new("job")
            .state(StubState::new("step1"))
            .state(StubState::new("step2"))
            .transition("step1", None, "step2")
            .end("step2", None)
            .build()
            .unwrap();

        let execution = flow.start(&NoopExecutor).unwrap();
        assert_eq!(execution.name(), "step2");
        assert_eq!(execution.status(), &FlowExecutionStatus::completed());
    }

    #[test]
    fn resume_enters_at_the_named_state() {
        let flow = FlowBuilder::new("job")
            .state(StubState::new("step1"))
            .state(StubState::new("step2"))
            .transition("step1", None, "step2")
            .end("step2", None)
            .build()
            .unwrap();

        let execution = flow.resume("step2", &NoopExecutor).unwrap();
        assert_eq!(execution.name(), "step2");
        assert_eq!(execution.status(), &FlowExecutionStatus::completed());
    }

    #[test]
    fn unmatched_status_fails_with_next_state_not_found() {
        let flow = FlowBuilder::new("job")
            .state(StubState::with_status(
                "step1",
                FlowExecutionStatus::failed(),
            ))
            .state(StubState::new("step2"))
            .transition("step1", Some("FOO"), "step2")
            .end("step1", Some("COMPLETED"))
            .end("step2", None)
            .build()
            .unwrap();

        let result = flow.start(&NoopExecutor);
        match result {
            Err(BatchError::FlowExecution(message)) => {
                assert!(
                    message.to_lowercase().contains("next state not found"),
                    "wrong message: {message}"
                );
            }
            other => panic!("expected a flow execution error, got {other:?}"),
        }
    }

    #[test]
    fn most_specific_transition_wins_on_overlap() {
        let flow = FlowBuilder::new("job")
            .state(StubState::new("step1"))
            .state(StubState::new("step2"))
            .state(StubState::new("step3"))
            .transition("step1", None, "step2")
            .transition("step1", Some("COMPLETED"), "step3")
            .end("step2", None)
            .end("step3", None)
            .build()
            .unwrap();

        let execution = flow.start(&NoopExecutor).unwrap();
        assert_eq!(execution.name(), "step3");
    }

    #[test]
    fn status_severity_comparator_orders_by_pattern_status() {
        let exact = StateTransition::new("s", Some("COMPLETED"), "a");
        let failed = StateTransition::new("s", Some("FAILED"), "b");
        let comparator = StateTransitionComparator::StatusSeverity;
        assert_eq!(comparator.compare(&exact, &failed), Ordering::Less);
    }

    #[test]
    fn split_aggregates_the_most_severe_branch_status() {
        let healthy = FlowBuilder::new("left")
            .state(StubState::new("a"))
            .end("a", None)
            .build()
            .unwrap();
        let failing = FlowBuilder::new("right")
            .state(StubState::with_status("b", FlowExecutionStatus::failed()))
            .end("b", None)
            .build()
            .unwrap();

        let split = SplitState::new("split", vec![healthy, failing]);
        let status = split.handle(&NoopExecutor).unwrap();
        assert_eq!(status, FlowExecutionStatus::failed());
    }
}
