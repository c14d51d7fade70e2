use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Serialize, Deserialize};
use tokio::sync::oneshot;
use crate::resolvers::builtin::{builtin_resolver, builtin_resolver_names};
use crate::resolvers::{PluginRegistry, ResolverMap, TaskResolver};
use crate::runtime::context::{FlowHandle, TaskContext};
use crate::runtime::error::FlowError;
use crate::runtime::flow::PendingResults;
use crate::runtime::log::FlowLogEntry;
use crate::runtime::options::{FlowConfigs, RunOptions};
use crate::runtime::process::ProcessManager;
use crate::runtime::state::FlowStateKind;
use crate::runtime::task::{Task, TaskRunStatus};
use crate::runtime::ValueMap;
use crate::spec::FlowSpec;

/// Process-wide counter for flow ids. Only used for diagnostics.
static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

type Settle = oneshot::Sender<Result<ValueMap, FlowError>>;

/// Senders for the futures handed out by start/resume, pause and stop.
#[derive(Default)]
pub(crate) struct Waiters {
    pub run: Option<Settle>,
    pub pause: Option<Settle>,
    pub stop: Option<Settle>,
}

impl Waiters {
    pub fn settle(slot: &mut Option<Settle>, result: Result<ValueMap, FlowError>) {
        if let Some(sender) = slot.take() {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = sender.send(result);
        }
    }

    pub fn create(slot: &mut Option<Settle>) -> PendingResults {
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        PendingResults::new(rx)
    }
}

/// 流程实例的全部可变状态
pub struct FlowRunStatus {
    pub id: u64,
    pub(crate) self_ref: Weak<Mutex<FlowRunStatus>>,
    pub spec: Arc<FlowSpec>,
    pub tasks: BTreeMap<String, Task>,
    /// Codes of tasks ready to be dispatched, oldest first, no duplicates.
    pub tasks_ready: VecDeque<String>,
    /// requirement or callback name -> codes of the tasks that take it
    pub tasks_by_req: HashMap<String, Vec<String>>,
    pub task_provisions: BTreeSet<String>,
    pub resolvers: ResolverMap,
    pub registry: Arc<PluginRegistry>,
    pub expected_results: Vec<String>,
    pub results: ValueMap,
    /// Names supplied so far with a non-null value.
    pub provided: BTreeSet<String>,
    pub context: Arc<ValueMap>,
    pub state: FlowStateKind,
    pub process_manager: ProcessManager,
    pub configs: FlowConfigs,
    pub run_options: RunOptions,
    pub(crate) waiters: Waiters,
    /// Task error raised while pausing or stopping; settles the flow once
    /// the processes have drained.
    pub(crate) pending_error: Option<FlowError>,
}

impl FlowRunStatus {
    pub(crate) fn new(self_ref: Weak<Mutex<FlowRunStatus>>, spec: Arc<FlowSpec>, registry: Arc<PluginRegistry>) -> Self {
        let mut status = Self {
            id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
            self_ref,
            configs: spec.configs.clone(),
            spec,
            tasks: BTreeMap::new(),
            tasks_ready: VecDeque::new(),
            tasks_by_req: HashMap::new(),
            task_provisions: BTreeSet::new(),
            resolvers: ResolverMap::new(),
            registry,
            expected_results: Vec::new(),
            results: ValueMap::new(),
            provided: BTreeSet::new(),
            context: Arc::new(ValueMap::new()),
            state: FlowStateKind::Ready,
            process_manager: ProcessManager::new(),
            run_options: RunOptions::default(),
            waiters: Waiters::default(),
            pending_error: None,
        };
        status.init_tasks();
        status
    }

    /// (Re)creates every task from the `FlowSpec` and rebuilds the indexes.
    pub(crate) fn init_tasks(&mut self) {
        self.tasks.clear();
        self.tasks_by_req.clear();
        self.task_provisions.clear();

        for (code, task_spec) in &self.spec.tasks {
            let task = Task::new(code, Arc::new(task_spec.clone()));

            for req in task_spec.requires.iter().chain(task_spec.callbacks.iter()) {
                let codes = self.tasks_by_req.entry(req.clone()).or_default();
                if !codes.contains(code) {
                    codes.push(code.clone());
                }
            }
            self.task_provisions.extend(task_spec.provides.iter().cloned());
            self.tasks.insert(code.clone(), task);
        }
    }

    pub(crate) fn handle(&self) -> FlowHandle {
        FlowHandle::new(self.self_ref.clone())
    }

    pub(crate) fn task_context(&self) -> TaskContext {
        TaskContext::new(self.context.clone(), self.handle())
    }

    pub fn set_resolvers(&mut self, resolvers: ResolverMap) {
        self.resolvers.extend(resolvers);
    }

    pub fn set_context(&mut self, context: ValueMap) {
        self.context = Arc::new(context);
    }

    /// Custom resolvers first, then plugins, then the built-in library.
    pub fn resolver_by_name(&self, name: &str) -> Option<Arc<dyn TaskResolver>> {
        if let Some(resolver) = self.resolvers.get(name) {
            return Some(resolver.clone());
        }
        if let Some(resolver) = self.registry.resolver(name) {
            return Some(resolver);
        }
        builtin_resolver(name)
    }

    pub fn resolver_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = builtin_resolver_names().iter().map(|n| n.to_string()).collect();
        names.extend(self.registry.resolver_names());
        names.extend(self.resolvers.keys().cloned());
        names.into_iter().collect()
    }

    pub fn resolver_for_task(&self, task: &Task) -> Result<Arc<dyn TaskResolver>, FlowError> {
        let name = task.resolver_name();
        self.resolver_by_name(name).ok_or_else(|| {
            let mut known: Vec<String> = self.resolvers.keys().cloned().collect();
            known.sort();
            FlowError::ResolverNotFound {
                resolver: name.to_string(),
                task: task.code.clone(),
                known,
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.process_manager.running_count() > 0
    }

    /// Fills in run-level fields and hands the entry to tracing and to every
    /// registered logger.
    pub(crate) fn log(&self, mut entry: FlowLogEntry) {
        entry.extra.debug_id = Some(self.id);
        entry.object_id = Some(self.run_options.instance_id);
        entry.fields = self.run_options.log_fields.clone();
        entry.trace_event();
        for logger in self.registry.loggers() {
            logger.log(&entry);
        }
    }

    pub fn to_serializable(&self) -> SerializedFlowRunStatus {
        SerializedFlowRunStatus {
            id: self.id,
            state: self.state,
            tasks_ready: self.tasks_ready.iter().cloned().collect(),
            task_status: self
                .tasks
                .iter()
                .map(|(code, task)| (code.clone(), task.run_status().clone()))
                .collect(),
            expected_results: self.expected_results.clone(),
            results: self.results.clone(),
            provided: self.provided.iter().cloned().collect(),
            context: (*self.context).clone(),
            run_options: self.run_options.clone(),
            next_pid: self.process_manager.next_pid(),
        }
    }

    /// Replays a snapshot into a status freshly built from the same spec.
    pub(crate) fn restore(&mut self, snapshot: &SerializedFlowRunStatus) -> Result<(), FlowError> {
        if matches!(snapshot.state, FlowStateKind::Running | FlowStateKind::Pausing | FlowStateKind::Stopping) {
            return Err(FlowError::Snapshot(format!(
                "flow cannot be restored in state {} because it had running processes",
                snapshot.state
            )));
        }

        for (code, task_status) in &snapshot.task_status {
            let task = self
                .tasks
                .get_mut(code)
                .ok_or_else(|| FlowError::Snapshot(format!("unknown task '{}'", code)))?;
            task.restore_run_status(task_status)?;
        }

        for code in &snapshot.tasks_ready {
            if !self.tasks.contains_key(code) {
                return Err(FlowError::Snapshot(format!("unknown ready task '{}'", code)));
            }
            if !self.tasks_ready.contains(code) {
                self.tasks_ready.push_back(code.clone());
            }
        }

        self.expected_results = snapshot.expected_results.clone();
        self.results = snapshot.results.clone();
        self.provided = snapshot.provided.iter().cloned().collect();
        self.context = Arc::new(snapshot.context.clone());
        self.run_options = snapshot.run_options.clone();
        self.process_manager.set_next_pid(snapshot.next_pid);
        self.state = snapshot.state;
        Ok(())
    }
}

/// Structural snapshot of a flow instance, enough to rebuild it from the same
/// spec. Storage is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedFlowRunStatus {
    pub id: u64,
    pub state: FlowStateKind,
    pub tasks_ready: Vec<String>,
    pub task_status: BTreeMap<String, TaskRunStatus>,
    pub expected_results: Vec<String>,
    pub results: ValueMap,
    pub provided: Vec<String>,
    pub context: ValueMap,
    pub run_options: RunOptions,
    pub next_pid: u64,
}
