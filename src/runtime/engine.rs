use std::path::Path;
use std::sync::Arc;
use anyhow::{Context as _, Result};
use tracing::info;
use crate::resolvers::{PluginRegistry, ResolverMap, TaskResolver};
use crate::runtime::error::FlowError;
use crate::runtime::flow::Flow;
use crate::runtime::log::FlowLogger;
use crate::runtime::options::RunOptions;
use crate::runtime::ValueMap;
use crate::spec::loader::load_flow_spec;
use crate::spec::FlowSpec;

/// Entry point for embedding applications: holds the plugin registry shared
/// by every flow it creates.
#[derive(Debug, Default)]
pub struct Engine {
    registry: Arc<PluginRegistry>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn register_resolver(&self, name: &str, resolver: Arc<dyn TaskResolver>) {
        self.registry.register_resolver(name, resolver);
    }

    pub fn register_logger(&self, logger: Arc<dyn FlowLogger>) {
        self.registry.register_logger(logger);
    }

    pub fn flow(&self, spec: FlowSpec) -> Flow {
        Flow::with_registry(spec, self.registry.clone())
    }

    /// Runs a spec once and waits for its results.
    pub async fn run<I, S>(
        &self,
        spec: FlowSpec,
        params: ValueMap,
        expected_results: I,
        resolvers: ResolverMap,
        context: ValueMap,
        options: RunOptions,
    ) -> Result<ValueMap, FlowError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let flow = self.flow(spec);
        flow.start(params, expected_results, resolvers, context, options)?.await
    }

    /// Loads a YAML or JSON spec file and runs it with the registered
    /// resolvers.
    pub async fn run_file(&self, path: &Path, params: ValueMap, expected_results: &[String]) -> Result<ValueMap> {
        let spec = load_flow_spec(&path.to_string_lossy())?;
        info!(path = %path.display(), tasks = spec.tasks.len(), "Loaded flow spec");

        let results = self
            .run(
                spec,
                params,
                expected_results.iter().cloned(),
                ResolverMap::new(),
                ValueMap::new(),
                RunOptions::default(),
            )
            .await
            .with_context(|| format!("Flow from {} failed", path.display()))?;
        Ok(results)
    }
}

