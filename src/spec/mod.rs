pub mod builder;
pub mod loader;

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::runtime::options::FlowConfigs;

/// Resolver used by tasks that declare no resolver at all.
pub const DEFAULT_RESOLVER: &str = "flowline::Noop";

/// 静态流程定义：任务按 code 索引
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowSpec {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub configs: FlowConfigs,
}

/// A single task: which names it needs, which it produces, and the resolver
/// that does the work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    /// Names that may be supplied repeatedly while the task is blocked.
    /// They never gate readiness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverSpec>,
    /// Supplied for every provision the resolver did not return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_result: Option<Value>,
}

impl TaskSpec {
    pub fn resolver_name(&self) -> &str {
        self.resolver.as_ref().map(|r| r.name.as_str()).unwrap_or(DEFAULT_RESOLVER)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResolverSpec {
    pub name: String,
    /// resolver param name -> where its value comes from
    #[serde(default)]
    pub params: BTreeMap<String, ParamSource>,
    /// resolver output name -> flow-level provision name
    #[serde(default)]
    pub results: BTreeMap<String, String>,
}

/// How a resolver parameter is obtained from the task's consumed values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamSource {
    /// Name of a requirement of the task.
    Name(String),
    /// A literal value, independent of the flow.
    Literal { value: Value },
    /// A JSON template rendered against the consumed values.
    Transform { transform: Value },
}

impl From<&str> for ParamSource {
    fn from(name: &str) -> Self {
        ParamSource::Name(name.to_string())
    }
}
