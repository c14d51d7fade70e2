use std::collections::BTreeSet;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use anyhow::Result;
use tracing::debug;
use crate::runtime::error::FlowError;
use crate::runtime::transform::apply_transform;
use crate::runtime::value_queue::ValueQueueManager;
use crate::runtime::ValueMap;
use crate::spec::{ParamSource, TaskSpec};

/// What a resolver sees of the task it runs for.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub code: String,
    pub spec: Arc<TaskSpec>,
}

/// Live, serializable part of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    pub solved_reqs: ValueQueueManager,
    pub solved_results: ValueMap,
    /// Set when the last run returned `TaskOutcome::Blocked` and nothing has
    /// been supplied to the task since.
    #[serde(default)]
    pub blocked: bool,
}

/// A task of one flow instance: the static spec plus its requirement queues.
#[derive(Debug, Clone)]
pub struct Task {
    pub code: String,
    pub spec: Arc<TaskSpec>,
    run_status: TaskRunStatus,
}

impl Task {
    pub fn new(code: &str, spec: Arc<TaskSpec>) -> Self {
        let mut task = Self {
            code: code.to_string(),
            spec,
            run_status: TaskRunStatus::default(),
        };
        task.reset_run_status();
        task
    }

    pub fn resolver_name(&self) -> &str {
        self.spec.resolver_name()
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            code: self.code.clone(),
            spec: self.spec.clone(),
        }
    }

    pub fn reset_run_status(&mut self) {
        self.run_status = TaskRunStatus {
            solved_reqs: ValueQueueManager::new(&self.spec.requires, &self.spec.callbacks),
            solved_results: ValueMap::new(),
            blocked: false,
        };
    }

    pub fn run_status(&self) -> &TaskRunStatus {
        &self.run_status
    }

    /// Replays a serialized run status on top of a freshly reset task.
    pub fn restore_run_status(&mut self, status: &TaskRunStatus) -> Result<(), FlowError> {
        self.reset_run_status();
        self.run_status
            .solved_reqs
            .restore_from(&status.solved_reqs)
            .map_err(|name| FlowError::InvalidRequirement {
                requirement: name,
                task: self.code.clone(),
            })?;
        self.run_status.solved_results = status.solved_results.clone();
        self.run_status.blocked = status.blocked;
        Ok(())
    }

    /// Ready when every `requires` queue has a pending value. Callback queues
    /// do not count.
    pub fn is_ready_to_run(&self) -> bool {
        self.run_status.solved_reqs.all_have_content(&self.spec.requires)
    }

    pub fn is_blocked(&self) -> bool {
        self.run_status.blocked
    }

    pub fn mark_blocked(&mut self) {
        self.run_status.blocked = true;
    }

    pub fn wake(&mut self) {
        self.run_status.blocked = false;
    }

    /// True when the task declares provisions and every one of them has
    /// already been supplied to the flow.
    pub fn has_all_provisions(&self, provided: &BTreeSet<String>) -> bool {
        !self.spec.provides.is_empty() && self.spec.provides.iter().all(|p| provided.contains(p))
    }

    pub fn supply_req(&mut self, name: &str, value: Value) -> Result<(), FlowError> {
        if !self.run_status.solved_reqs.push(name, value) {
            return Err(FlowError::InvalidRequirement {
                requirement: name.to_string(),
                task: self.code.clone(),
            });
        }
        // Anything new may be what a blocked resolver was waiting for.
        self.run_status.blocked = false;
        Ok(())
    }

    pub fn supply_reqs(&mut self, reqs: &ValueMap) -> Result<(), FlowError> {
        for (name, value) in reqs {
            self.supply_req(name, value.clone())?;
        }
        Ok(())
    }

    /// Consumes one value from every requirement and callback queue.
    pub fn take_requirements(&mut self) -> ValueMap {
        self.run_status.solved_reqs.take_top_all()
    }

    pub fn peek_requirements(&self) -> ValueMap {
        self.run_status.solved_reqs.peek_top_all()
    }

    pub fn results(&self) -> &ValueMap {
        &self.run_status.solved_results
    }

    pub fn set_results(&mut self, results: ValueMap) {
        self.run_status.solved_results = results;
    }

    pub fn map_params_for_resolver(&self, solved_reqs: &ValueMap, automap: bool) -> Result<ValueMap> {
        map_params_for_resolver(&self.code, &self.spec, solved_reqs, automap)
    }

    pub fn map_results_from_resolver(&self, output: &ValueMap, automap: bool) -> ValueMap {
        map_results_from_resolver(&self.code, &self.spec, output, automap)
    }
}

/// Builds the resolver params of a task run from the values it consumed.
///
/// Explicit `params` entries win over automapped ones. A name that was not
/// consumed maps to null.
pub fn map_params_for_resolver(code: &str, spec: &TaskSpec, solved_reqs: &ValueMap, automap: bool) -> Result<ValueMap> {
    let mut sources: Vec<(String, ParamSource)> = Vec::new();

    if automap {
        for req in &spec.requires {
            sources.push((req.clone(), ParamSource::Name(req.clone())));
        }
        debug!(task = code, requires = ?spec.requires, "Auto-mapped resolver params");
    }

    if let Some(resolver) = &spec.resolver {
        for (name, source) in &resolver.params {
            sources.retain(|(n, _)| n != name);
            sources.push((name.clone(), source.clone()));
        }
    }

    let mut params = ValueMap::new();
    for (name, source) in sources {
        let value = match source {
            ParamSource::Name(req) => solved_reqs.get(&req).cloned().unwrap_or(Value::Null),
            ParamSource::Literal { value } => value,
            ParamSource::Transform { transform } => apply_transform(&transform, solved_reqs)?,
        };
        params.insert(name, value);
    }

    Ok(params)
}

/// Picks the task's provisions out of a resolver output. Outputs the
/// resolver did not return are left out.
pub fn map_results_from_resolver(code: &str, spec: &TaskSpec, output: &ValueMap, automap: bool) -> ValueMap {
    let mut mapping: Vec<(String, String)> = Vec::new();

    if automap {
        for provision in &spec.provides {
            mapping.push((provision.clone(), provision.clone()));
        }
        debug!(task = code, provides = ?spec.provides, "Auto-mapped resolver results");
    }

    if let Some(resolver) = &spec.resolver {
        for (output_name, provision) in &resolver.results {
            mapping.retain(|(o, p)| o != output_name && p != provision);
            mapping.push((output_name.clone(), provision.clone()));
        }
    }

    let mut results = ValueMap::new();
    for (output_name, provision) in mapping {
        if let Some(value) = output.get(&output_name) {
            results.insert(provision, value.clone());
        }
    }
    results
}
