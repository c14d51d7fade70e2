use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use async_trait::async_trait;
use anyhow::{Context as _, Result, anyhow, bail};
use evalexpr::{eval_boolean_with_context, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{debug, info};
use crate::resolvers::{PluginRegistry, TaskOutcome, TaskResolver};
use crate::runtime::context::TaskContext;
use crate::runtime::flow::{value_map, Flow};
use crate::runtime::options::RunOptions;
use crate::runtime::task::TaskInfo;
use crate::runtime::ValueMap;
use crate::spec::{FlowSpec, TaskSpec};

pub const NOOP: &str = "flowline::Noop";
pub const ECHO: &str = "flowline::Echo";
pub const THROW_ERROR: &str = "flowline::ThrowError";
pub const WAIT: &str = "flowline::Wait";
pub const CONDITIONAL: &str = "flowline::Conditional";
pub const PAUSE: &str = "flowline::Pause";
pub const STOP: &str = "flowline::Stop";
pub const SUB_FLOW: &str = "flowline::SubFlow";
pub const REPEATER: &str = "flowline::Repeater";
pub const LOOP: &str = "flowline::Loop";
pub const ARRAY_MAP: &str = "flowline::ArrayMap";

const DEFAULT_ERROR_MESSAGE: &str = "ThrowError resolver has thrown an error";

static BUILTINS: LazyLock<HashMap<&'static str, Arc<dyn TaskResolver>>> = LazyLock::new(|| {
    let mut builtins: HashMap<&'static str, Arc<dyn TaskResolver>> = HashMap::new();
    builtins.insert(NOOP, Arc::new(NoopResolver));
    builtins.insert(ECHO, Arc::new(EchoResolver));
    builtins.insert(THROW_ERROR, Arc::new(ThrowErrorResolver));
    builtins.insert(WAIT, Arc::new(WaitResolver));
    builtins.insert(CONDITIONAL, Arc::new(ConditionalResolver));
    builtins.insert(PAUSE, Arc::new(PauseResolver));
    builtins.insert(STOP, Arc::new(StopResolver));
    builtins.insert(SUB_FLOW, Arc::new(SubFlowResolver));
    builtins.insert(REPEATER, Arc::new(RepeaterResolver));
    builtins.insert(LOOP, Arc::new(LoopResolver));
    builtins.insert(ARRAY_MAP, Arc::new(ArrayMapResolver));
    builtins
});

pub fn builtin_resolver(name: &str) -> Option<Arc<dyn TaskResolver>> {
    BUILTINS.get(name).cloned()
}

pub fn builtin_resolver_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BUILTINS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Does nothing and provides nothing.
#[derive(Debug)]
pub struct NoopResolver;

#[async_trait]
impl TaskResolver for NoopResolver {
    async fn exec(&self, _params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
        Ok(TaskOutcome::empty())
    }
}

/// Returns its params as outputs.
#[derive(Debug)]
pub struct EchoResolver;

#[async_trait]
impl TaskResolver for EchoResolver {
    async fn exec(&self, params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
        Ok(TaskOutcome::Completed(params))
    }
}

/// Always fails, with the `message` param when given.
#[derive(Debug)]
pub struct ThrowErrorResolver;

#[async_trait]
impl TaskResolver for ThrowErrorResolver {
    async fn exec(&self, params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
        let message = match params.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => DEFAULT_ERROR_MESSAGE.to_string(),
            Some(other) => other.to_string(),
        };
        Err(anyhow!(message))
    }
}

/// Sleeps `ms` milliseconds, then outputs its `result` param if there is one.
#[derive(Debug)]
pub struct WaitResolver;

#[async_trait]
impl TaskResolver for WaitResolver {
    async fn exec(&self, params: ValueMap, _context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let ms = match params.get("ms") {
            Some(Value::Null) | None => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| anyhow!("Wait resolver expects 'ms' to be a non-negative integer, got {}", value))?,
        };

        debug!(task = %task.code, ms, "Waiting");
        tokio::time::sleep(Duration::from_millis(ms)).await;

        let mut output = ValueMap::new();
        if let Some(result) = params.get("result") {
            output.insert("result".to_string(), result.clone());
        }
        Ok(TaskOutcome::Completed(output))
    }
}

/// Routes `trueResult` to `onTrue` or `falseResult` to `onFalse`.
///
/// `condition` is either a boolean or an evalexpr expression evaluated with
/// the other scalar params as variables.
#[derive(Debug)]
pub struct ConditionalResolver;

#[async_trait]
impl TaskResolver for ConditionalResolver {
    async fn exec(&self, params: ValueMap, _context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let condition = match params.get("condition") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(expr)) => evaluate_condition(expr, &params)
                .with_context(|| format!("Invalid condition in task '{}'", task.code))?,
            Some(Value::Null) | None => false,
            Some(other) => bail!("Conditional resolver expects a boolean or an expression, got {}", other),
        };

        let (key, source) = if condition {
            ("onTrue", "trueResult")
        } else {
            ("onFalse", "falseResult")
        };

        let mut output = ValueMap::new();
        output.insert(key.to_string(), params.get(source).cloned().unwrap_or(Value::Null));
        Ok(TaskOutcome::Completed(output))
    }
}

fn evaluate_condition(expr: &str, params: &ValueMap) -> Result<bool> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in params {
        let eval_val = match v {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(ev) = eval_val {
            eval_ctx
                .set_value(k.clone(), ev)
                .map_err(|e| anyhow!("Cannot bind '{}': {}", k, e))?;
        }
    }

    eval_boolean_with_context(expr, &eval_ctx).map_err(|e| anyhow!("'{}': {}", expr, e))
}

/// Pauses its own flow. The flow settles in `Paused` once this task returns.
#[derive(Debug)]
pub struct PauseResolver;

#[async_trait]
impl TaskResolver for PauseResolver {
    async fn exec(&self, _params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        info!(task = %task.code, "Pausing flow");
        let _pending = context.flow().pause()?;
        Ok(TaskOutcome::empty())
    }
}

/// Stops its own flow.
#[derive(Debug)]
pub struct StopResolver;

#[async_trait]
impl TaskResolver for StopResolver {
    async fn exec(&self, _params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        info!(task = %task.code, "Stopping flow");
        let _pending = context.flow().stop()?;
        Ok(TaskOutcome::empty())
    }
}

/// Runs `flowSpec` as a nested flow with `flowParams`, and outputs the
/// results named in `flowExpectedResults` as `flowResult`.
///
/// The nested flow sees the same resolvers and context as the parent.
#[derive(Debug)]
pub struct SubFlowResolver;

#[async_trait]
impl TaskResolver for SubFlowResolver {
    async fn exec(&self, params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let spec_value = params
            .get("flowSpec")
            .cloned()
            .ok_or_else(|| anyhow!("SubFlow resolver in task '{}' needs a 'flowSpec' param", task.code))?;
        let spec: FlowSpec = serde_json::from_value(spec_value)
            .with_context(|| format!("Invalid sub-flow spec in task '{}'", task.code))?;

        let flow_params = value_map(params.get("flowParams").cloned().unwrap_or(Value::Null));
        let expected: Vec<String> = match params.get("flowExpectedResults") {
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| n.as_str().map(str::to_string).ok_or_else(|| anyhow!("Expected result names must be strings, got {}", n)))
                .collect::<Result<_>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => bail!("'flowExpectedResults' must be an array, got {}", other),
        };

        let registry = context.flow().registry().unwrap_or_else(|| Arc::new(PluginRegistry::new()));
        let sub_flow = Flow::with_registry(spec, registry);
        debug!(task = %task.code, sub_flow = sub_flow.id(), "Starting sub-flow");

        let results = sub_flow
            .start(
                flow_params,
                expected,
                context.flow().custom_resolvers(),
                context.values().clone(),
                RunOptions::default(),
            )?
            .await?;

        Ok(TaskOutcome::Completed(value_map(json!({ "flowResult": results }))))
    }
}

/// Runs the resolver named `resolver` `count` times with `params`, and outputs
/// every run's outputs in order as `results`. Runs concurrently unless
/// `parallel` is false.
#[derive(Debug)]
pub struct RepeaterResolver;

#[async_trait]
impl TaskResolver for RepeaterResolver {
    async fn exec(&self, params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let name = string_param(&params, "resolver", task)?;
        let count = match params.get("count") {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| anyhow!("Repeater resolver expects 'count' to be a non-negative integer, got {}", value))?,
            None => bail!("Repeater resolver in task '{}' needs a 'count' param", task.code),
        };
        let run_params = value_map(params.get("params").cloned().unwrap_or(Value::Null));
        let parallel = bool_param(&params, "parallel", true);

        let runs = (0..count).map(|_| run_params.clone()).collect();
        let results = run_repeated(&name, runs, parallel, context, task).await?;
        Ok(TaskOutcome::Completed(value_map(json!({ "results": results }))))
    }
}

/// Runs the resolver named `resolver` once per object of `array`, using the
/// object as its params, and outputs the outputs in order as `results`.
#[derive(Debug)]
pub struct ArrayMapResolver;

#[async_trait]
impl TaskResolver for ArrayMapResolver {
    async fn exec(&self, params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let name = string_param(&params, "resolver", task)?;
        let runs = match params.get("array") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map.clone()),
                    other => Err(anyhow!("ArrayMap resolver expects an array of objects, got item {}", other)),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => bail!("ArrayMap resolver expects 'array' to be an array, got {}", other),
            None => bail!("ArrayMap resolver in task '{}' needs an 'array' param", task.code),
        };
        let parallel = bool_param(&params, "parallel", true);

        let results = run_repeated(&name, runs, parallel, context, task).await?;
        Ok(TaskOutcome::Completed(value_map(json!({ "results": results }))))
    }
}

/// Runs `subtask` (a task spec) as a one-task flow for every item of
/// `inCollection`. Each item is supplied as `inItemName`; the value provided
/// as `outItemName` is collected into `outCollection`.
#[derive(Debug)]
pub struct LoopResolver;

#[async_trait]
impl TaskResolver for LoopResolver {
    async fn exec(&self, params: ValueMap, context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        let items = match params.get("inCollection") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => bail!("Loop resolver expects 'inCollection' to be an array, got {}", other),
            None => bail!("Loop resolver in task '{}' needs an 'inCollection' param", task.code),
        };
        let in_name = string_param(&params, "inItemName", task)?;
        let out_name = string_param(&params, "outItemName", task)?;
        let subtask: TaskSpec = serde_json::from_value(params.get("subtask").cloned().unwrap_or(Value::Null))
            .with_context(|| format!("Invalid subtask spec in task '{}'", task.code))?;
        let parallel = bool_param(&params, "parallel", true);

        let mut tasks = BTreeMap::new();
        tasks.insert("subtask".to_string(), subtask);
        let spec = FlowSpec { tasks, ..FlowSpec::default() };
        let registry = context.flow().registry().unwrap_or_else(|| Arc::new(PluginRegistry::new()));

        let start = |item: Value| {
            let flow = Flow::with_registry(spec.clone(), registry.clone());
            let mut flow_params = ValueMap::new();
            flow_params.insert(in_name.clone(), item);
            let pending = flow.start(
                flow_params,
                [out_name.clone()],
                context.flow().custom_resolvers(),
                context.values().clone(),
                RunOptions::default(),
            );
            pending.map(|pending| (flow, pending))
        };

        debug!(task = %task.code, items = items.len(), parallel, "Looping over collection");
        let mut collected = Vec::with_capacity(items.len());
        if parallel {
            // Every flow is started before any is awaited.
            let started = items.into_iter().map(start).collect::<Result<Vec<_>, _>>()?;
            for (_flow, pending) in started {
                let results = pending.await?;
                collected.push(results.get(&out_name).cloned().unwrap_or(Value::Null));
            }
        } else {
            for item in items {
                let (_flow, pending) = start(item)?;
                let results = pending.await?;
                collected.push(results.get(&out_name).cloned().unwrap_or(Value::Null));
            }
        }

        Ok(TaskOutcome::Completed(value_map(json!({ "outCollection": collected }))))
    }
}

fn string_param(params: &ValueMap, key: &str, task: &TaskInfo) -> Result<String> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => bail!("'{}' must be a string in task '{}', got {}", key, task.code, other),
        None => bail!("Task '{}' needs a '{}' param", task.code, key),
    }
}

fn bool_param(params: &ValueMap, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Calls the resolver `name` once per entry of `runs` and returns the outputs
/// in the same order.
async fn run_repeated(
    name: &str,
    runs: Vec<ValueMap>,
    parallel: bool,
    context: &TaskContext,
    task: &TaskInfo,
) -> Result<Vec<Value>> {
    let resolver = context
        .flow()
        .resolver(name)
        .or_else(|| builtin_resolver(name))
        .ok_or_else(|| anyhow!("Task resolver '{}' used by task '{}' has no definition", name, task.code))?;

    let mut outputs = vec![Value::Null; runs.len()];
    if parallel {
        let mut set = JoinSet::new();
        for (i, run_params) in runs.into_iter().enumerate() {
            let resolver = resolver.clone();
            let context = context.clone();
            let task = task.clone();
            set.spawn(async move { (i, resolver.exec(run_params, &context, &task).await) });
        }
        while let Some(joined) = set.join_next().await {
            let (i, outcome) = joined.context("Repeated resolver run panicked")?;
            outputs[i] = completed_output(name, outcome?)?;
        }
    } else {
        for (i, run_params) in runs.into_iter().enumerate() {
            outputs[i] = completed_output(name, resolver.exec(run_params, context, task).await?)?;
        }
    }
    Ok(outputs)
}

fn completed_output(name: &str, outcome: TaskOutcome) -> Result<Value> {
    match outcome {
        TaskOutcome::Completed(output) => Ok(Value::Object(output)),
        TaskOutcome::Blocked => bail!("Resolver '{}' blocked inside a repeated run", name),
    }
}
