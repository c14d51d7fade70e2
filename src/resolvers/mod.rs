use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use crate::runtime::context::TaskContext;
use crate::runtime::log::FlowLogger;
use crate::runtime::task::TaskInfo;
use crate::runtime::ValueMap;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock, PoisonError};

pub mod builtin;

/// Resolvers supplied by the caller for a single flow, keyed by the name
/// used in `TaskSpec::resolver.name`.
pub type ResolverMap = HashMap<String, Arc<dyn TaskResolver>>;

/// What a resolver run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Resolver outputs, keyed by resolver-local name.
    Completed(ValueMap),
    /// The resolver cannot complete until a callback value is supplied. The
    /// task is re-queued instead of failing.
    Blocked,
}

impl TaskOutcome {
    /// Wraps a JSON object as a completed outcome. Anything other than an
    /// object violates the resolver contract.
    pub fn completed(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(TaskOutcome::Completed(map)),
            other => Err(anyhow!(
                "Expected resolver to return an object. Returned value is '{}'.",
                other
            )),
        }
    }

    pub fn empty() -> Self {
        TaskOutcome::Completed(ValueMap::new())
    }
}

/// 插件接口：所有任务实现都必须实现此 Trait
#[async_trait]
pub trait TaskResolver: Send + Sync + Debug {
    async fn exec(&self, params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome>;
}

/// Explicit plugin registry shared by the flows that are given it.
///
/// Lookup order for a task's resolver is: the flow's custom resolvers, then
/// the resolvers registered here, then the built-in library.
#[derive(Default)]
pub struct PluginRegistry {
    resolvers: DashMap<String, Arc<dyn TaskResolver>>,
    loggers: RwLock<Vec<Arc<dyn FlowLogger>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_resolver(&self, name: &str, resolver: Arc<dyn TaskResolver>) {
        self.resolvers.insert(name.to_string(), resolver);
    }

    pub fn resolver(&self, name: &str) -> Option<Arc<dyn TaskResolver>> {
        self.resolvers.get(name).map(|r| r.value().clone())
    }

    pub fn resolver_names(&self) -> Vec<String> {
        self.resolvers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn register_logger(&self, logger: Arc<dyn FlowLogger>) {
        self.loggers.write().unwrap_or_else(PoisonError::into_inner).push(logger);
    }

    pub fn loggers(&self) -> Vec<Arc<dyn FlowLogger>> {
        self.loggers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("resolvers", &self.resolver_names())
            .finish_non_exhaustive()
    }
}
