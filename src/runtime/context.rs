use std::sync::{Arc, Mutex, Weak};
use serde_json::Value;
use crate::resolvers::{PluginRegistry, ResolverMap, TaskResolver};
use crate::runtime::error::FlowError;
use crate::runtime::flow::{lock_status, PendingResults};
use crate::runtime::state::FlowStateKind;
use crate::runtime::status::FlowRunStatus;
use crate::runtime::ValueMap;

/// 运行时上下文 (Runtime Context)
/// 调用方提供的数据，加上指回所属流程的受限句柄
#[derive(Clone)]
pub struct TaskContext {
    values: Arc<ValueMap>,
    flow: FlowHandle,
}

impl TaskContext {
    pub(crate) fn new(values: Arc<ValueMap>, flow: FlowHandle) -> Self {
        Self { values, flow }
    }

    /// A context that is not attached to any flow. Useful for calling a
    /// resolver directly.
    pub fn detached(values: ValueMap) -> Self {
        Self {
            values: Arc::new(values),
            flow: FlowHandle { status: Weak::new() },
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    pub fn flow(&self) -> &FlowHandle {
        &self.flow
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext").field("values", &self.values).finish_non_exhaustive()
    }
}

/// The operations a running resolver may invoke on its own flow.
///
/// Holds a weak reference: a resolver keeping its context alive does not keep
/// the flow alive.
#[derive(Clone)]
pub struct FlowHandle {
    status: Weak<Mutex<FlowRunStatus>>,
}

impl FlowHandle {
    pub(crate) fn new(status: Weak<Mutex<FlowRunStatus>>) -> Self {
        Self { status }
    }

    fn upgrade(&self) -> Result<Arc<Mutex<FlowRunStatus>>, FlowError> {
        self.status.upgrade().ok_or(FlowError::Abandoned)
    }

    /// Requests a pause. The returned future settles once every running
    /// process, including the caller's own, has finished, so a resolver must
    /// not await it before returning.
    pub fn pause(&self) -> Result<PendingResults, FlowError> {
        let status = self.upgrade()?;
        let mut status = lock_status(&status);
        status.pause()
    }

    /// Requests a stop. Same caveat as `pause`.
    pub fn stop(&self) -> Result<PendingResults, FlowError> {
        let status = self.upgrade()?;
        let mut status = lock_status(&status);
        status.stop()
    }

    pub fn supply_result(&self, name: &str, value: Value) -> Result<(), FlowError> {
        let status = self.upgrade()?;
        let mut status = lock_status(&status);
        status.supply_external_result(name, value);
        Ok(())
    }

    pub fn state_code(&self) -> Option<FlowStateKind> {
        let status = self.status.upgrade()?;
        let status = lock_status(&status);
        Some(status.state)
    }

    /// Looks a resolver up with the same priority the flow uses.
    pub fn resolver(&self, name: &str) -> Option<Arc<dyn TaskResolver>> {
        let status = self.status.upgrade()?;
        let status = lock_status(&status);
        status.resolver_by_name(name)
    }

    pub fn resolver_names(&self) -> Vec<String> {
        match self.status.upgrade() {
            Some(status) => lock_status(&status).resolver_names(),
            None => Vec::new(),
        }
    }

    /// The flow's custom resolvers, for resolvers that start nested flows.
    pub fn custom_resolvers(&self) -> ResolverMap {
        match self.status.upgrade() {
            Some(status) => lock_status(&status).resolvers.clone(),
            None => ResolverMap::new(),
        }
    }

    pub fn registry(&self) -> Option<Arc<PluginRegistry>> {
        let status = self.status.upgrade()?;
        let status = lock_status(&status);
        Some(status.registry.clone())
    }
}
