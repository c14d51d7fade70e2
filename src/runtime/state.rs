//! Flow lifecycle and the scheduling algorithm.
//!
//! A flow instance is always in exactly one `FlowStateKind`. Every operation
//! first asks the transition table whether it is legal in the current state;
//! the scheduling primitives (`supply_result`, `dispatch_ready_tasks`,
//! `on_process_finished`) are shared by all states and only ever dispatch new
//! processes while the flow is `Running`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::debug;
use crate::resolvers::{ResolverMap, TaskResolver};
use crate::runtime::error::FlowError;
use crate::runtime::flow::{lock_status, PendingResults};
use crate::runtime::log::{FlowEvent, FlowLogEntry, LogLevel};
use crate::runtime::options::RunOptions;
use crate::runtime::process::{ProcessOutcome, ProcessRecord};
use crate::runtime::status::{FlowRunStatus, SerializedFlowRunStatus, Waiters};
use crate::runtime::ValueMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowStateKind {
    Ready,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowTransition {
    Start,
    Finished,
    Reset,
    Pause,
    Paused,
    Resume,
    Stop,
    Stopped,
}

impl FlowStateKind {
    /// The state reached by applying `transition`, or `None` when the
    /// transition is not legal here.
    pub fn next(self, transition: FlowTransition) -> Option<FlowStateKind> {
        use FlowStateKind as S;
        use FlowTransition as T;

        match (self, transition) {
            (S::Ready, T::Start) => Some(S::Running),
            (S::Running, T::Finished) => Some(S::Finished),
            (S::Running, T::Pause) => Some(S::Pausing),
            (S::Running, T::Stop) => Some(S::Stopping),
            (S::Pausing, T::Paused) => Some(S::Paused),
            (S::Paused, T::Resume) => Some(S::Running),
            (S::Paused, T::Stop) => Some(S::Stopping),
            (S::Stopping, T::Stopped) => Some(S::Stopped),
            (S::Stopped | S::Finished, T::Reset) => Some(S::Ready),
            _ => None,
        }
    }

    /// True while task processes may still be in flight.
    pub fn has_processes(self) -> bool {
        matches!(self, FlowStateKind::Running | FlowStateKind::Pausing | FlowStateKind::Stopping)
    }
}

impl fmt::Display for FlowStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for FlowTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn ensure_runtime() -> Result<(), FlowError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|e| FlowError::Runtime(e.to_string()))
}

impl FlowRunStatus {
    fn ensure_transition(&self, transition: FlowTransition) -> Result<FlowStateKind, FlowError> {
        self.state.next(transition).ok_or(FlowError::Transition {
            transition,
            state: self.state,
        })
    }

    fn transition(&mut self, transition: FlowTransition) -> Result<(), FlowError> {
        let next = self.ensure_transition(transition)?;
        let previous = self.state;
        self.state = next;
        self.log(FlowLogEntry::debug(
            FlowEvent::FlowStateChanged,
            format!("Flow state changed from {} to {}", previous, next),
        ));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------

    pub(crate) fn start(
        &mut self,
        params: ValueMap,
        expected_results: Vec<String>,
        resolvers: ResolverMap,
        context: ValueMap,
        options: RunOptions,
    ) -> Result<PendingResults, FlowError> {
        self.ensure_transition(FlowTransition::Start)?;
        ensure_runtime()?;
        if self.configs.max_concurrency == Some(0) {
            return Err(FlowError::Configs("maxConcurrency must be at least 1".to_string()));
        }
        let unsolvable = self.unsolvable_results(&expected_results, &params);
        if !unsolvable.is_empty() && self.configs.throw_error_on_unsolvable_result {
            return Err(FlowError::UnsolvableResults(unsolvable));
        }

        // Validated; nothing below fails.
        self.run_options = options;
        if !unsolvable.is_empty() {
            self.log(FlowLogEntry::warning(FlowError::UnsolvableResults(unsolvable).to_string()));
        }
        self.expected_results = expected_results;
        self.set_resolvers(resolvers);
        self.set_context(context);

        self.log(FlowLogEntry::info(FlowEvent::FlowStarted, "Flow started with params").with_values(&Value::Object(params.clone())));

        // 1. 参数当作任务结果注入
        for (name, value) in params {
            self.supply_result(&name, value);
        }
        for (code, task) in &self.tasks {
            if task.is_ready_to_run() && !self.tasks_ready.contains(code) {
                self.tasks_ready.push_back(code.clone());
            }
        }

        // 2. 进入 Running 并派发就绪任务
        let pending = Waiters::create(&mut self.waiters.run);
        self.transition(FlowTransition::Start)?;
        self.check_progress();

        Ok(pending)
    }

    pub(crate) fn pause(&mut self) -> Result<PendingResults, FlowError> {
        self.transition(FlowTransition::Pause)?;
        let pending = Waiters::create(&mut self.waiters.pause);

        if !self.is_running() {
            self.paused();
        }
        Ok(pending)
    }

    pub(crate) fn resume(&mut self) -> Result<PendingResults, FlowError> {
        self.ensure_transition(FlowTransition::Resume)?;
        ensure_runtime()?;

        let pending = Waiters::create(&mut self.waiters.run);
        self.transition(FlowTransition::Resume)?;

        for task in self.tasks.values_mut() {
            task.wake();
        }
        self.check_progress();

        Ok(pending)
    }

    pub(crate) fn stop(&mut self) -> Result<PendingResults, FlowError> {
        self.transition(FlowTransition::Stop)?;
        let pending = Waiters::create(&mut self.waiters.stop);

        if !self.is_running() {
            self.stopped();
        }
        Ok(pending)
    }

    /// Returns a finished or stopped flow to `Ready` with fresh task queues.
    pub(crate) fn reset(&mut self) -> Result<(), FlowError> {
        self.transition(FlowTransition::Reset)?;

        self.init_tasks();
        self.tasks_ready.clear();
        self.expected_results.clear();
        self.results.clear();
        self.provided.clear();
        // In-flight processes of a failed run become stale; their completions
        // are dropped.
        self.process_manager.clear();
        self.waiters = Waiters::default();
        self.pending_error = None;
        Ok(())
    }

    /// `supply_result` as called from outside the scheduler. Legal in every
    /// state; dispatches right away when the flow is running.
    pub(crate) fn supply_external_result(&mut self, name: &str, value: Value) {
        if !self.tasks_by_req.contains_key(name) && !self.expected_results.iter().any(|r| r == name) {
            self.log(FlowLogEntry::warning(format!(
                "Result '{}' was supplied but no task requires it",
                name
            )));
        }

        self.supply_result(name, value);

        if self.state == FlowStateKind::Running {
            self.check_progress();
        }
    }

    pub(crate) fn get_serializable_state(&self) -> Result<SerializedFlowRunStatus, FlowError> {
        if self.state.has_processes() {
            return Err(FlowError::Method {
                method: "get_serializable_state",
                state: self.state,
            });
        }
        Ok(self.to_serializable())
    }

    // ---------------------------------------------------------------
    // Scheduling primitives
    // ---------------------------------------------------------------

    /// Expected results that no task provides and no param supplies.
    fn unsolvable_results(&self, expected_results: &[String], params: &ValueMap) -> Vec<String> {
        expected_results
            .iter()
            .filter(|name| !self.task_provisions.contains(*name) && !params.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Appends `value` to the queue of every task that requires `name`.
    /// Tasks that become ready are queued once.
    pub(crate) fn supply_result(&mut self, name: &str, value: Value) {
        let codes = self.tasks_by_req.get(name).cloned().unwrap_or_default();
        let mut rejected = Vec::new();

        for code in codes {
            let Some(task) = self.tasks.get_mut(&code) else { continue };
            if let Err(e) = task.supply_req(name, value.clone()) {
                rejected.push(e);
                continue;
            }
            if task.is_ready_to_run() && !self.tasks_ready.contains(&code) {
                self.tasks_ready.push_back(code);
            }
        }

        for e in rejected {
            self.log(FlowLogEntry::warning(e.to_string()));
        }

        if self.expected_results.iter().any(|r| r == name) {
            self.results.insert(name.to_string(), value.clone());
        }
        if !value.is_null() {
            self.provided.insert(name.to_string());
        }
    }

    /// Starts a process for every queued task that may run now. Blocked tasks
    /// and tasks over the concurrency cap stay queued.
    pub(crate) fn dispatch_ready_tasks(&mut self) {
        if self.state != FlowStateKind::Running {
            return;
        }

        let mut deferred = VecDeque::new();

        while let Some(code) = self.tasks_ready.pop_front() {
            let Some(task) = self.tasks.get(&code) else { continue };

            // A task runs one process at a time; it is looked at again when
            // that process finishes.
            if task.is_blocked() || self.process_manager.is_task_running(&code) {
                deferred.push_back(code);
                continue;
            }
            if task.has_all_provisions(&self.provided) {
                debug!(flow_id = self.id, task = %code, "Skipping task, all its provisions are already provided");
                continue;
            }
            if !task.is_ready_to_run() {
                continue;
            }
            if let Some(max) = self.configs.max_concurrency {
                if self.process_manager.running_count() >= max {
                    deferred.push_back(code);
                    deferred.extend(self.tasks_ready.drain(..));
                    break;
                }
            }

            let resolver = match self.resolver_for_task(task) {
                Ok(resolver) => resolver,
                Err(e) => {
                    deferred.extend(self.tasks_ready.drain(..));
                    self.tasks_ready = deferred;
                    self.finish(Err(e));
                    return;
                }
            };

            self.spawn_process(&code, resolver);
        }

        self.tasks_ready = deferred;
    }

    fn spawn_process(&mut self, code: &str, resolver: Arc<dyn TaskResolver>) {
        let context = self.task_context();
        let automap_params = self.configs.resolver_automap_params;
        let automap_results = self.configs.resolver_automap_results;

        let Some(task) = self.tasks.get_mut(code) else { return };
        let solved_reqs = task.take_requirements();
        let process = self
            .process_manager
            .create_process(task, resolver, solved_reqs, context, automap_params, automap_results);

        let pid = process.pid;
        if let Some(record) = self.process_manager.process(pid) {
            let entry = FlowLogEntry::info(FlowEvent::TaskStarted, "Task started with params")
                .with_values(&Value::Object(record.params.clone()))
                .with_task(&record.task_code, &record.resolver_name, pid);
            self.log(entry);
        }

        let Some(shared) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            // Run the resolver in its own task so a panic is reported as a
            // task failure instead of leaving the flow waiting forever.
            let outcome = match tokio::spawn(process.run()).await {
                Ok(outcome) => outcome,
                Err(e) => ProcessOutcome::Failed(format!("Task process panicked: {}", e)),
            };
            lock_status(&shared).on_process_finished(pid, outcome);
        });
    }

    pub(crate) fn on_process_finished(&mut self, pid: u64, outcome: ProcessOutcome) {
        let Some(record) = self.process_manager.remove_process(pid) else {
            debug!(flow_id = self.id, pid, "Dropping completion of an untracked process");
            return;
        };
        if !self.state.has_processes() {
            debug!(flow_id = self.id, pid, task = %record.task_code, state = %self.state, "Absorbing completion after the flow settled");
            return;
        }

        match outcome {
            ProcessOutcome::Completed(results) => {
                self.log(
                    FlowLogEntry::info(FlowEvent::TaskFinished, "Task finished with results")
                        .with_values(&Value::Object(results.clone()))
                        .with_task(&record.task_code, &record.resolver_name, pid),
                );
                if let Some(task) = self.tasks.get_mut(&record.task_code) {
                    task.set_results(results.clone());
                }
                self.propagate_results(&record.task_code, &results);
            }
            ProcessOutcome::Blocked => {
                self.log(
                    FlowLogEntry::debug(FlowEvent::TaskFinished, "Task blocked, waiting for a callback")
                        .with_task(&record.task_code, &record.resolver_name, pid),
                );
                self.requeue_blocked(&record);
            }
            ProcessOutcome::Failed(message) => {
                self.log(
                    FlowLogEntry::new(LogLevel::Error, FlowEvent::TaskFinished, format!("Task failed: {}", message))
                        .with_task(&record.task_code, &record.resolver_name, pid),
                );
                let results = self
                    .tasks
                    .get(&record.task_code)
                    .map(|t| t.results().clone())
                    .unwrap_or_default();
                self.on_task_error(FlowError::Task {
                    code: record.task_code.clone(),
                    results,
                    message,
                });
            }
        }

        self.check_progress();
    }

    fn propagate_results(&mut self, code: &str, results: &ValueMap) {
        let Some(task) = self.tasks.get(code) else { return };
        let provides = task.spec.provides.clone();
        let default_result = task.spec.default_result.clone();

        for name in provides {
            if let Some(value) = results.get(&name) {
                self.supply_result(&name, value.clone());
            } else if let Some(value) = &default_result {
                self.supply_result(&name, value.clone());
            } else {
                self.log(FlowLogEntry::warning(format!(
                    "Task '{}' did not provide '{}' and has no default result",
                    code, name
                )));
            }
        }
    }

    /// Puts a blocked task back in the ready queue with the values it
    /// consumed, so nothing is lost while it waits.
    fn requeue_blocked(&mut self, record: &ProcessRecord) {
        let Some(task) = self.tasks.get_mut(&record.task_code) else { return };
        let spec = task.spec.clone();
        let mut rejected = Vec::new();

        for name in &spec.requires {
            let value = self.results.get(name).or_else(|| record.solved_reqs.get(name)).cloned();
            if let Some(value) = value {
                if let Err(e) = task.supply_req(name, value) {
                    rejected.push(e);
                }
            }
        }
        for name in &spec.callbacks {
            let value = self.results.get(name).or_else(|| record.solved_reqs.get(name)).cloned();
            if let Some(value) = value {
                if let Err(e) = task.supply_req(name, value) {
                    rejected.push(e);
                }
            }
        }
        task.mark_blocked();

        if !self.tasks_ready.contains(&record.task_code) {
            self.tasks_ready.push_back(record.task_code.clone());
        }
        for e in rejected {
            self.log(FlowLogEntry::warning(e.to_string()));
        }
    }

    fn on_task_error(&mut self, error: FlowError) {
        match self.state {
            FlowStateKind::Running => self.finish(Err(error)),
            FlowStateKind::Pausing | FlowStateKind::Stopping => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(error);
                }
            }
            state => {
                debug!(flow_id = self.id, %state, error = %error, "Ignoring task error outside a running flow");
            }
        }
    }

    /// Settles the flow when nothing is left to do.
    fn check_progress(&mut self) {
        match self.state {
            FlowStateKind::Running => {
                self.dispatch_ready_tasks();
                if self.state != FlowStateKind::Running || self.is_running() {
                    return;
                }
                if self.tasks_ready.is_empty() {
                    self.finish(Ok(()));
                } else {
                    // Only blocked tasks are left: wait for their callbacks
                    // in Paused.
                    self.log(FlowLogEntry::debug(FlowEvent::General, "Only blocked tasks remain, pausing flow"));
                    if self.transition(FlowTransition::Pause).is_ok() {
                        self.paused();
                    }
                }
            }
            FlowStateKind::Pausing if !self.is_running() => self.paused(),
            FlowStateKind::Stopping if !self.is_running() => self.stopped(),
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Settling
    // ---------------------------------------------------------------

    fn finish(&mut self, outcome: Result<(), FlowError>) {
        if self.transition(FlowTransition::Finished).is_err() {
            return;
        }

        match outcome {
            Ok(()) => {
                self.log(
                    FlowLogEntry::info(FlowEvent::FlowFinished, "Flow finished with results")
                        .with_values(&Value::Object(self.results.clone())),
                );
                Waiters::settle(&mut self.waiters.run, Ok(self.results.clone()));
            }
            Err(e) => {
                self.log(
                    FlowLogEntry::new(LogLevel::Error, FlowEvent::FlowFinished, format!("Flow finished with error: {}", e)),
                );
                Waiters::settle(&mut self.waiters.run, Err(e));
            }
        }
    }

    fn paused(&mut self) {
        if self.transition(FlowTransition::Paused).is_err() {
            return;
        }
        self.log(
            FlowLogEntry::info(FlowEvent::FlowPaused, "Flow paused with partial results")
                .with_values(&Value::Object(self.results.clone())),
        );

        match self.pending_error.take() {
            Some(e) => {
                Waiters::settle(&mut self.waiters.pause, Err(e.clone()));
                Waiters::settle(&mut self.waiters.run, Err(e));
            }
            None => {
                Waiters::settle(&mut self.waiters.pause, Ok(self.results.clone()));
                Waiters::settle(&mut self.waiters.run, Ok(self.results.clone()));
            }
        }
    }

    fn stopped(&mut self) {
        if self.transition(FlowTransition::Stopped).is_err() {
            return;
        }
        self.log(
            FlowLogEntry::info(FlowEvent::FlowStopped, "Flow stopped with results")
                .with_values(&Value::Object(self.results.clone())),
        );

        match self.pending_error.take() {
            Some(e) => {
                Waiters::settle(&mut self.waiters.stop, Err(e.clone()));
                Waiters::settle(&mut self.waiters.run, Err(e));
            }
            None => {
                Waiters::settle(&mut self.waiters.stop, Ok(self.results.clone()));
                Waiters::settle(&mut self.waiters.run, Ok(self.results.clone()));
            }
        }
    }
}
