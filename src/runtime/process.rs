use std::collections::BTreeMap;
use std::sync::Arc;
use crate::resolvers::{TaskOutcome, TaskResolver};
use crate::runtime::context::TaskContext;
use crate::runtime::task::{map_results_from_resolver, Task, TaskInfo};
use crate::runtime::ValueMap;

/// How a task process ended, as reported back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Resolver outputs already mapped to the task's provision names.
    Completed(ValueMap),
    Blocked,
    Failed(String),
}

/// Bookkeeping the process manager keeps for every running process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u64,
    pub task_code: String,
    pub resolver_name: String,
    pub params: ValueMap,
    /// Values consumed from the task's queues for this run.
    pub solved_reqs: ValueMap,
}

/// One execution attempt of a task.
pub struct TaskProcess {
    pub pid: u64,
    task: TaskInfo,
    resolver: Arc<dyn TaskResolver>,
    params: Result<ValueMap, String>,
    context: TaskContext,
    automap_results: bool,
}

impl TaskProcess {
    pub async fn run(self) -> ProcessOutcome {
        let params = match self.params {
            Ok(params) => params,
            Err(message) => return ProcessOutcome::Failed(message),
        };

        match self.resolver.exec(params, &self.context, &self.task).await {
            Ok(TaskOutcome::Completed(output)) => ProcessOutcome::Completed(map_results_from_resolver(
                &self.task.code,
                &self.task.spec,
                &output,
                self.automap_results,
            )),
            Ok(TaskOutcome::Blocked) => ProcessOutcome::Blocked,
            Err(e) => ProcessOutcome::Failed(format!("{:#}", e)),
        }
    }
}

/// Owns the processes currently running for one flow instance.
#[derive(Debug)]
pub struct ProcessManager {
    next_pid: u64,
    processes: BTreeMap<u64, ProcessRecord>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self {
            next_pid: 1,
            processes: BTreeMap::new(),
        }
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new process for `task`. Param mapping failures are
    /// carried into the process and reported when it runs.
    pub fn create_process(
        &mut self,
        task: &Task,
        resolver: Arc<dyn TaskResolver>,
        solved_reqs: ValueMap,
        context: TaskContext,
        automap_params: bool,
        automap_results: bool,
    ) -> TaskProcess {
        let pid = self.next_pid;
        self.next_pid += 1;

        let params = task
            .map_params_for_resolver(&solved_reqs, automap_params)
            .map_err(|e| format!("{:#}", e));

        self.processes.insert(pid, ProcessRecord {
            pid,
            task_code: task.code.clone(),
            resolver_name: task.resolver_name().to_string(),
            params: params.clone().unwrap_or_default(),
            solved_reqs,
        });

        TaskProcess {
            pid,
            task: task.info(),
            resolver,
            params,
            context,
            automap_results,
        }
    }

    pub fn remove_process(&mut self, pid: u64) -> Option<ProcessRecord> {
        self.processes.remove(&pid)
    }

    pub fn process(&self, pid: u64) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn is_task_running(&self, code: &str) -> bool {
        self.processes.values().any(|p| p.task_code == code)
    }

    pub fn running_count(&self) -> usize {
        self.processes.len()
    }

    /// Forgets every running process. Their completions are ignored later.
    pub fn clear(&mut self) {
        self.processes.clear();
    }

    pub fn next_pid(&self) -> u64 {
        self.next_pid
    }

    pub fn set_next_pid(&mut self, next_pid: u64) {
        self.next_pid = next_pid.max(self.next_pid);
    }
}
