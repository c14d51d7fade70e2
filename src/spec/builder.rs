use crate::spec::{FlowSpec, TaskSpec, ResolverSpec, ParamSource};
use crate::runtime::options::FlowConfigs;
use std::collections::BTreeMap;
use serde_json::Value;

pub struct FlowSpecBuilder {
    tasks: BTreeMap<String, TaskSpec>,
    configs: FlowConfigs,
}

impl FlowSpecBuilder {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            configs: FlowConfigs::default(),
        }
    }

    pub fn configs(mut self, configs: FlowConfigs) -> Self {
        self.configs = configs;
        self
    }

    pub fn task(self, code: &str) -> TaskBuilder {
        TaskBuilder {
            flow_builder: self,
            code: code.to_string(),
            spec: TaskSpec::default(),
        }
    }

    pub fn build(self) -> FlowSpec {
        FlowSpec {
            tasks: self.tasks,
            configs: self.configs,
        }
    }
}

impl Default for FlowSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskBuilder {
    flow_builder: FlowSpecBuilder,
    code: String,
    spec: TaskSpec,
}

impl TaskBuilder {
    pub fn requires(mut self, names: &[&str]) -> Self {
        self.spec.requires.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn provides(mut self, names: &[&str]) -> Self {
        self.spec.provides.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn callbacks(mut self, names: &[&str]) -> Self {
        self.spec.callbacks.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn resolver(mut self, name: &str) -> Self {
        self.resolver_spec().name = name.to_string();
        self
    }

    /// Maps a resolver param to one of the task's requirements.
    pub fn param(mut self, key: &str, requirement: &str) -> Self {
        self.resolver_spec().params.insert(key.to_string(), ParamSource::Name(requirement.to_string()));
        self
    }

    pub fn value_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.resolver_spec().params.insert(key.to_string(), ParamSource::Literal { value: value.into() });
        self
    }

    pub fn transform_param(mut self, key: &str, template: impl Into<Value>) -> Self {
        self.resolver_spec().params.insert(key.to_string(), ParamSource::Transform { transform: template.into() });
        self
    }

    /// Maps a resolver output to a flow-level provision.
    pub fn result(mut self, key: &str, provision: &str) -> Self {
        self.resolver_spec().results.insert(key.to_string(), provision.to_string());
        self
    }

    pub fn default_result(mut self, value: impl Into<Value>) -> Self {
        self.spec.default_result = Some(value.into());
        self
    }

    pub fn build(mut self) -> FlowSpecBuilder {
        self.flow_builder.tasks.insert(self.code, self.spec);
        self.flow_builder
    }

    fn resolver_spec(&mut self) -> &mut ResolverSpec {
        self.spec.resolver.get_or_insert_with(ResolverSpec::default)
    }
}
