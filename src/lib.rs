//! Dataflow task orchestration.
//!
//! A flow is a set of tasks wired together by names: each task declares the
//! values it `requires` and the values it `provides`. A task runs as soon as
//! every value it requires has been supplied, and its outputs are fed to the
//! tasks waiting on them. Flows can be paused, serialized, restored and
//! resumed.

pub mod resolvers;
pub mod runtime;
pub mod spec;

pub use resolvers::{PluginRegistry, ResolverMap, TaskOutcome, TaskResolver};
pub use runtime::context::{FlowHandle, TaskContext};
pub use runtime::engine::Engine;
pub use runtime::error::FlowError;
pub use runtime::flow::{value_map, Flow, PendingResults};
pub use runtime::log::{FlowEvent, FlowLogEntry, FlowLogger, LogLevel};
pub use runtime::options::{FlowConfigs, RunOptions};
pub use runtime::state::{FlowStateKind, FlowTransition};
pub use runtime::status::SerializedFlowRunStatus;
pub use runtime::task::TaskInfo;
pub use runtime::ValueMap;
pub use spec::{FlowSpec, ParamSource, ResolverSpec, TaskSpec};
