use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use serde_json::Value;
use tokio::sync::oneshot;
use crate::resolvers::{PluginRegistry, ResolverMap};
use crate::runtime::error::FlowError;
use crate::runtime::options::RunOptions;
use crate::runtime::state::FlowStateKind;
use crate::runtime::status::{FlowRunStatus, SerializedFlowRunStatus};
use crate::runtime::ValueMap;
use crate::spec::FlowSpec;

/// Locks a run status. A panic while holding the lock leaves the status
/// consistent at step granularity, so poisoning is ignored.
pub(crate) fn lock_status(status: &Mutex<FlowRunStatus>) -> MutexGuard<'_, FlowRunStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns a JSON object into a `ValueMap`. Anything else gives an empty map.
pub fn value_map(value: Value) -> ValueMap {
    match value {
        Value::Object(map) => map,
        _ => ValueMap::new(),
    }
}

/// Future returned by `start`, `resume`, `pause` and `stop`.
///
/// Resolves with the flow's results when the flow settles: finished, paused
/// (the results so far) or stopped.
#[derive(Debug)]
#[must_use = "the flow keeps running, but its results are lost if this is dropped"]
pub struct PendingResults {
    receiver: oneshot::Receiver<Result<ValueMap, FlowError>>,
}

impl PendingResults {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<ValueMap, FlowError>>) -> Self {
        Self { receiver }
    }
}

impl Future for PendingResults {
    type Output = Result<ValueMap, FlowError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(FlowError::Abandoned)))
    }
}

/// One instance of a flow spec.
///
/// All operations are synchronous bookkeeping under a lock; the work happens
/// in task processes on the tokio runtime, and the returned `PendingResults`
/// settle when the flow reaches the matching state.
pub struct Flow {
    status: Arc<Mutex<FlowRunStatus>>,
}

impl Flow {
    pub fn new(spec: FlowSpec) -> Self {
        Self::with_registry(spec, Arc::new(PluginRegistry::new()))
    }

    pub fn with_registry(spec: FlowSpec, registry: Arc<PluginRegistry>) -> Self {
        let spec = Arc::new(spec);
        let status = Arc::new_cyclic(|weak| Mutex::new(FlowRunStatus::new(weak.clone(), spec, registry)));
        Self { status }
    }

    /// Rebuilds a flow from a snapshot taken with `get_serializable_state`
    /// and the same spec. A non-empty `context` replaces the saved one.
    pub fn from_state(
        spec: FlowSpec,
        snapshot: &SerializedFlowRunStatus,
        resolvers: ResolverMap,
        context: ValueMap,
    ) -> Result<Self, FlowError> {
        Self::from_state_with_registry(spec, snapshot, resolvers, context, Arc::new(PluginRegistry::new()))
    }

    pub fn from_state_with_registry(
        spec: FlowSpec,
        snapshot: &SerializedFlowRunStatus,
        resolvers: ResolverMap,
        context: ValueMap,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self, FlowError> {
        let flow = Self::with_registry(spec, registry);
        {
            let mut status = lock_status(&flow.status);
            status.restore(snapshot)?;
            status.set_resolvers(resolvers);
            if !context.is_empty() {
                status.set_context(context);
            }
        }
        Ok(flow)
    }

    pub fn id(&self) -> u64 {
        lock_status(&self.status).id
    }

    pub fn state_code(&self) -> FlowStateKind {
        lock_status(&self.status).state
    }

    pub fn start<I, S>(
        &self,
        params: ValueMap,
        expected_results: I,
        resolvers: ResolverMap,
        context: ValueMap,
        options: RunOptions,
    ) -> Result<PendingResults, FlowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected_results = expected_results.into_iter().map(Into::into).collect();
        lock_status(&self.status).start(params, expected_results, resolvers, context, options)
    }

    pub fn pause(&self) -> Result<PendingResults, FlowError> {
        lock_status(&self.status).pause()
    }

    pub fn resume(&self) -> Result<PendingResults, FlowError> {
        lock_status(&self.status).resume()
    }

    pub fn stop(&self) -> Result<PendingResults, FlowError> {
        lock_status(&self.status).stop()
    }

    pub fn reset(&self) -> Result<(), FlowError> {
        lock_status(&self.status).reset()
    }

    /// Supplies a value from outside, typically a callback a blocked task is
    /// waiting for. Allowed in any state.
    pub fn supply_result(&self, name: &str, value: Value) {
        lock_status(&self.status).supply_external_result(name, value);
    }

    pub fn get_serializable_state(&self) -> Result<SerializedFlowRunStatus, FlowError> {
        lock_status(&self.status).get_serializable_state()
    }

    /// The results collected so far.
    pub fn results(&self) -> ValueMap {
        lock_status(&self.status).results.clone()
    }

    pub fn running_count(&self) -> usize {
        lock_status(&self.status).process_manager.running_count()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = lock_status(&self.status);
        f.debug_struct("Flow")
            .field("id", &status.id)
            .field("state", &status.state)
            .finish_non_exhaustive()
    }
}
