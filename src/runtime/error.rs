use thiserror::Error;
use crate::runtime::state::{FlowStateKind, FlowTransition};
use crate::runtime::ValueMap;

/// Errors surfaced by the flow engine.
///
/// Cloneable so that a single task failure can settle every pending future
/// of a flow (run, pause, stop) with the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("Cannot execute transition {transition} in current state {state}.")]
    Transition {
        transition: FlowTransition,
        state: FlowStateKind,
    },

    #[error("Cannot execute method {method} in current state {state}.")]
    Method {
        method: &'static str,
        state: FlowStateKind,
    },

    #[error("Invalid flow configs: {0}")]
    Configs(String),

    #[error("The results [{}] are not provided by any task", .0.join(", "))]
    UnsolvableResults(Vec<String>),

    #[error("Task resolver '{resolver}' for task '{task}' has no definition. Defined custom resolvers are: [{}].", .known.join(", "))]
    ResolverNotFound {
        resolver: String,
        task: String,
        known: Vec<String>,
    },

    /// A resolver failed. Carries the task code and whatever results the task
    /// had solved before failing.
    #[error("Task '{code}' failed: {message}")]
    Task {
        code: String,
        results: ValueMap,
        message: String,
    },

    #[error("Requirement '{requirement}' for task '{task}' is not valid.")]
    InvalidRequirement { requirement: String, task: String },

    #[error("Invalid serialized flow state: {0}")]
    Snapshot(String),

    /// Task processes need a tokio runtime to be spawned on.
    #[error("No tokio runtime available to run tasks: {0}")]
    Runtime(String),

    /// The flow was dropped before the awaited operation settled.
    #[error("Flow was dropped before settling")]
    Abandoned,
}

impl FlowError {
    pub fn task_code(&self) -> Option<&str> {
        match self {
            FlowError::Task { code, .. } => Some(code),
            _ => None,
        }
    }
}
