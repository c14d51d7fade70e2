use serde::{Serialize, Deserialize};
use uuid::Uuid;
use crate::runtime::ValueMap;

/// Engine behaviour declared alongside the flow spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowConfigs {
    /// Fail `start` when an expected result is not provided by any task,
    /// instead of only logging a warning.
    pub throw_error_on_unsolvable_result: bool,
    /// Pass every requirement to the resolver under its own name, unless an
    /// explicit param mapping overrides it.
    pub resolver_automap_params: bool,
    /// Take every provision from the resolver output under its own name,
    /// unless an explicit result mapping overrides it.
    pub resolver_automap_results: bool,
    /// Upper bound on concurrently running task processes. `None` means no cap.
    pub max_concurrency: Option<usize>,
}

impl Default for FlowConfigs {
    fn default() -> Self {
        Self {
            throw_error_on_unsolvable_result: false,
            resolver_automap_params: true,
            resolver_automap_results: true,
            max_concurrency: None,
        }
    }
}

/// Per-run options given to `start`. Only affects diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunOptions {
    /// Identifier attached to every log entry of this run as `object_id`.
    pub instance_id: Uuid,
    /// Extra fields merged into every log entry of this run.
    pub log_fields: ValueMap,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            log_fields: ValueMap::new(),
        }
    }
}

impl RunOptions {
    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_log_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.log_fields.insert(key.to_string(), value.into());
        self
    }
}
