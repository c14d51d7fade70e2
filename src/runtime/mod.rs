pub mod context;
pub mod engine;
pub mod error;
pub mod flow;
pub mod log;
pub mod options;
pub mod process;
pub mod state;
pub mod status;
pub mod task;
pub mod transform;
pub mod value_queue;

/// Named JSON values: params, results, context.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;
