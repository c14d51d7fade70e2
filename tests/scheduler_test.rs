use flowline::spec::builder::FlowSpecBuilder;
use flowline::{
    value_map, Flow, FlowConfigs, FlowError, FlowLogEntry, FlowLogger, FlowStateKind, LogLevel, PluginRegistry,
    ResolverMap, RunOptions, TaskContext, TaskInfo, TaskOutcome, TaskResolver, ValueMap,
};
use async_trait::async_trait;
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Records the order in which tasks start and provides `"<code>:<name>"` for
/// every declared provision.
#[derive(Debug, Default)]
struct Recorder {
    started: Mutex<Vec<String>>,
}

impl Recorder {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn position(&self, code: &str) -> usize {
        self.started()
            .iter()
            .position(|c| c == code)
            .unwrap_or_else(|| panic!("task {} never started", code))
    }
}

#[async_trait]
impl TaskResolver for Recorder {
    async fn exec(&self, _params: ValueMap, _context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
        self.started.lock().unwrap().push(task.code.clone());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let mut output = ValueMap::new();
        for name in &task.spec.provides {
            output.insert(name.clone(), json!(format!("{}:{}", task.code, name)));
        }
        Ok(TaskOutcome::Completed(output))
    }
}

#[derive(Debug)]
struct Failing;

#[async_trait]
impl TaskResolver for Failing {
    async fn exec(&self, _params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
        Err(anyhow!("boom"))
    }
}

#[derive(Default)]
struct CollectingLogger {
    entries: Mutex<Vec<FlowLogEntry>>,
}

impl FlowLogger for CollectingLogger {
    fn log(&self, entry: &FlowLogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

impl CollectingLogger {
    fn warnings(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == LogLevel::Warning)
            .map(|e| e.message.clone())
            .collect()
    }
}

macro_rules! resolvers {
    ($($name:expr => $resolver:expr),* $(,)?) => {{
        let mut map = ResolverMap::new();
        $( map.insert($name.to_string(), $resolver as Arc<dyn TaskResolver>); )*
        map
    }};
}

#[tokio::test]
async fn test_dependency_graph_dispatch_order() {
    let spec = FlowSpecBuilder::new()
        .task("B").requires(&["param1"]).provides(&["b1"]).resolver("rec").build()
        .task("C").requires(&["param2"]).provides(&["c1", "c2"]).resolver("rec").build()
        .task("A").requires(&["b1", "c1", "c2"]).provides(&["a4", "a5"]).resolver("rec").build()
        .task("D").requires(&["a4", "a5"]).provides(&["d3"]).resolver("rec").build()
        .task("F").requires(&["param3"]).provides(&["f1"]).resolver("rec").build()
        .task("E").requires(&["a5", "f1"]).provides(&["e3"]).resolver("rec").build()
        .task("G").requires(&["d3", "e3"]).provides(&["g1", "g2"]).resolver("rec").build()
        .build();

    let recorder = Arc::new(Recorder::default());
    let flow = Flow::new(spec);

    let results = flow
        .start(
            value_map(json!({ "param1": 1, "param2": 2, "param3": 3 })),
            ["g1", "g2"],
            resolvers!("rec" => recorder.clone()),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "g1": "G:g1", "g2": "G:g2" })));
    assert_eq!(flow.state_code(), FlowStateKind::Finished);

    // Every task ran exactly once
    assert_eq!(recorder.started().len(), 7);

    for first in ["B", "C", "F"] {
        assert!(recorder.position(first) < recorder.position("A"));
        assert!(recorder.position(first) < recorder.position("E"));
    }
    assert!(recorder.position("A") < recorder.position("D"));
    assert!(recorder.position("D") < recorder.position("G"));
    assert!(recorder.position("E") < recorder.position("G"));
}

#[tokio::test]
async fn test_zero_task_flow_finishes_immediately() {
    let flow = Flow::new(FlowSpecBuilder::new().build());

    let results = flow
        .start(ValueMap::new(), Vec::<String>::new(), ResolverMap::new(), ValueMap::new(), RunOptions::default())
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert!(results.is_empty());
    assert_eq!(flow.state_code(), FlowStateKind::Finished);
}

#[tokio::test]
async fn test_params_can_be_expected_results() {
    let spec = FlowSpecBuilder::new()
        .task("double").requires(&["x"]).provides(&["y"]).resolver("rec").build()
        .build();

    let results = Flow::new(spec)
        .start(
            value_map(json!({ "x": 21 })),
            ["x", "y"],
            resolvers!("rec" => Arc::new(Recorder::default())),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "x": 21, "y": "double:y" })));
}

#[tokio::test]
async fn test_task_does_not_run_until_all_requirements_are_supplied() {
    let spec = FlowSpecBuilder::new()
        .task("join").requires(&["left", "right"]).provides(&["joined"]).resolver("rec").build()
        .build();

    let recorder = Arc::new(Recorder::default());
    let results = Flow::new(spec)
        .start(
            value_map(json!({ "left": 1 })),
            ["joined"],
            resolvers!("rec" => recorder.clone()),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert!(recorder.started().is_empty());
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_missing_provision_is_a_warning() {
    #[derive(Debug)]
    struct ProvidesNothing;

    #[async_trait]
    impl TaskResolver for ProvidesNothing {
        async fn exec(&self, _params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
            Ok(TaskOutcome::empty())
        }
    }

    let spec = FlowSpecBuilder::new()
        .task("lazy").provides(&["x"]).resolver("nothing").build()
        .task("other").provides(&["y"]).resolver("rec").build()
        .task("after_x").requires(&["x"]).provides(&["z"]).resolver("rec").build()
        .build();

    let logger = Arc::new(CollectingLogger::default());
    let registry = Arc::new(PluginRegistry::new());
    registry.register_logger(logger.clone());

    let flow = Flow::with_registry(spec, registry);
    let results = flow
        .start(
            ValueMap::new(),
            ["y"],
            resolvers!("nothing" => Arc::new(ProvidesNothing), "rec" => Arc::new(Recorder::default())),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "y": "other:y" })));
    assert!(!results.contains_key("x"));
    assert_eq!(flow.state_code(), FlowStateKind::Finished);
    assert!(
        logger.warnings().iter().any(|m| m.contains("'lazy'") && m.contains("'x'")),
        "expected a missing provision warning, got {:?}",
        logger.warnings()
    );
}

#[tokio::test]
async fn test_default_result_fills_missing_provision() {
    #[derive(Debug)]
    struct ProvidesNothing;

    #[async_trait]
    impl TaskResolver for ProvidesNothing {
        async fn exec(&self, _params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
            Ok(TaskOutcome::empty())
        }
    }

    let spec = FlowSpecBuilder::new()
        .task("lazy").provides(&["x"]).resolver("nothing").default_result("fallback").build()
        .task("after_x").requires(&["x"]).provides(&["z"]).resolver("rec").build()
        .build();

    let results = Flow::new(spec)
        .start(
            ValueMap::new(),
            ["x", "z"],
            resolvers!("nothing" => Arc::new(ProvidesNothing), "rec" => Arc::new(Recorder::default())),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "x": "fallback", "z": "after_x:z" })));
}

#[tokio::test]
async fn test_unsolvable_expected_result_in_strict_mode() {
    let spec = FlowSpecBuilder::new()
        .configs(FlowConfigs {
            throw_error_on_unsolvable_result: true,
            ..FlowConfigs::default()
        })
        .task("t").provides(&["a"]).build()
        .build();

    let flow = Flow::new(spec);
    let instance_id = Uuid::new_v4();
    let err = flow
        .start(
            ValueMap::new(),
            ["a", "ghost", "phantom"],
            ResolverMap::new(),
            ValueMap::new(),
            RunOptions::default().with_instance_id(instance_id),
        )
        .err()
        .expect("start should fail");

    assert_eq!(err, FlowError::UnsolvableResults(vec!["ghost".to_string(), "phantom".to_string()]));
    assert_eq!(err.to_string(), "The results [ghost, phantom] are not provided by any task");
    assert_eq!(flow.state_code(), FlowStateKind::Ready);

    // The rejected start left nothing behind
    let state = flow.get_serializable_state().expect("Failed to serialize");
    assert_ne!(state.run_options.instance_id, instance_id);
    assert!(state.expected_results.is_empty());
}

#[tokio::test]
async fn test_zero_max_concurrency_is_rejected() {
    let spec = FlowSpecBuilder::new()
        .configs(FlowConfigs {
            max_concurrency: Some(0),
            ..FlowConfigs::default()
        })
        .task("t").provides(&["a"]).build()
        .build();

    let flow = Flow::new(spec);
    let err = flow
        .start(ValueMap::new(), ["a"], ResolverMap::new(), ValueMap::new(), RunOptions::default())
        .err()
        .expect("start should fail");

    assert!(matches!(err, FlowError::Configs(_)));
    assert_eq!(flow.state_code(), FlowStateKind::Ready);
}

#[tokio::test]
async fn test_unsolvable_expected_result_warns_by_default() {
    let spec = FlowSpecBuilder::new().task("t").provides(&["a"]).build().build();

    let logger = Arc::new(CollectingLogger::default());
    let registry = Arc::new(PluginRegistry::new());
    registry.register_logger(logger.clone());

    let results = Flow::with_registry(spec, registry)
        .start(ValueMap::new(), ["ghost"], ResolverMap::new(), ValueMap::new(), RunOptions::default())
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert!(results.is_empty());
    assert!(logger.warnings().iter().any(|m| m.contains("ghost")));
}

#[tokio::test]
async fn test_task_error_rejects_run() {
    let spec = FlowSpecBuilder::new()
        .task("ok").requires(&["p"]).provides(&["a"]).resolver("rec").build()
        .task("bad").requires(&["a"]).provides(&["b"]).resolver("fail").build()
        .task("never").requires(&["b"]).provides(&["c"]).resolver("rec").build()
        .build();

    let recorder = Arc::new(Recorder::default());
    let flow = Flow::new(spec);
    let err = flow
        .start(
            value_map(json!({ "p": true })),
            ["c"],
            resolvers!("rec" => recorder.clone(), "fail" => Arc::new(Failing)),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect_err("Flow should fail");

    match &err {
        FlowError::Task { code, message, .. } => {
            assert_eq!(code, "bad");
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.task_code(), Some("bad"));
    assert_eq!(flow.state_code(), FlowStateKind::Finished);
    assert_eq!(recorder.started(), vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_missing_resolver_rejects_run() {
    let spec = FlowSpecBuilder::new().task("aTask").resolver("r").build().build();

    #[derive(Debug)]
    struct Unused;

    #[async_trait]
    impl TaskResolver for Unused {
        async fn exec(&self, _params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
            Ok(TaskOutcome::empty())
        }
    }

    let err = Flow::new(spec)
        .start(ValueMap::new(), Vec::<String>::new(), resolvers!("x" => Arc::new(Unused)), ValueMap::new(), RunOptions::default())
        .expect("Failed to start flow")
        .await
        .expect_err("Flow should fail");

    assert_eq!(
        err.to_string(),
        "Task resolver 'r' for task 'aTask' has no definition. Defined custom resolvers are: [x]."
    );
}

#[tokio::test]
async fn test_max_concurrency_limits_running_processes() {
    #[derive(Debug, Default)]
    struct Gauge {
        current: Mutex<usize>,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl TaskResolver for Gauge {
        async fn exec(&self, _params: ValueMap, _context: &TaskContext, task: &TaskInfo) -> Result<TaskOutcome> {
            {
                let mut current = self.current.lock().unwrap();
                *current += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*current);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            *self.current.lock().unwrap() -= 1;
            let mut output = ValueMap::new();
            output.insert(task.spec.provides[0].clone(), json!(task.code));
            Ok(TaskOutcome::Completed(output))
        }
    }

    let mut builder = FlowSpecBuilder::new().configs(FlowConfigs {
        max_concurrency: Some(2),
        ..FlowConfigs::default()
    });
    let mut expected = Vec::new();
    for i in 0..6 {
        let provision = format!("out{}", i);
        builder = builder
            .task(&format!("t{}", i))
            .requires(&["go"])
            .provides(&[provision.as_str()])
            .resolver("gauge")
            .build();
        expected.push(provision);
    }

    let gauge = Arc::new(Gauge::default());
    let results = Flow::new(builder.build())
        .start(
            value_map(json!({ "go": 1 })),
            expected,
            resolvers!("gauge" => gauge.clone()),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results.len(), 6);
    assert_eq!(*gauge.peak.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_task_with_all_provisions_supplied_is_skipped() {
    let spec = FlowSpecBuilder::new()
        .task("compute").requires(&["p"]).provides(&["x"]).resolver("rec").build()
        .build();

    let recorder = Arc::new(Recorder::default());
    let results = Flow::new(spec)
        .start(
            value_map(json!({ "p": 1, "x": "given" })),
            ["x"],
            resolvers!("rec" => recorder.clone()),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert!(recorder.started().is_empty());
    assert_eq!(results.get("x"), Some(&Value::from("given")));
}

#[tokio::test]
async fn test_supply_result_while_running_unlocks_tasks() {
    #[derive(Debug)]
    struct SupplyLater;

    #[async_trait]
    impl TaskResolver for SupplyLater {
        async fn exec(&self, _params: ValueMap, context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
            context.flow().supply_result("side", json!("from inside"))?;
            Ok(TaskOutcome::empty())
        }
    }

    let spec = FlowSpecBuilder::new()
        .task("producer").resolver("later").build()
        .task("consumer").requires(&["side"]).provides(&["done"]).resolver("rec").build()
        .build();

    let results = Flow::new(spec)
        .start(
            ValueMap::new(),
            ["done"],
            resolvers!("later" => Arc::new(SupplyLater), "rec" => Arc::new(Recorder::default())),
            ValueMap::new(),
            RunOptions::default(),
        )
        .expect("Failed to start flow")
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "done": "consumer:done" })));
}

#[tokio::test]
async fn test_running_task_is_not_dispatched_again() {
    /// Counts its runs and provides `y` from `x` after a delay.
    #[derive(Debug, Default)]
    struct Slow {
        runs: Mutex<usize>,
    }

    #[async_trait]
    impl TaskResolver for Slow {
        async fn exec(&self, params: ValueMap, _context: &TaskContext, _task: &TaskInfo) -> Result<TaskOutcome> {
            *self.runs.lock().unwrap() += 1;
            tokio::time::sleep(Duration::from_millis(30)).await;
            TaskOutcome::completed(json!({ "y": params.get("x").cloned().unwrap_or(Value::Null) }))
        }
    }

    let spec = FlowSpecBuilder::new()
        .task("t").requires(&["x"]).provides(&["y"]).resolver("slow").build()
        .build();

    let slow = Arc::new(Slow::default());
    let flow = Flow::new(spec);
    let run = flow
        .start(value_map(json!({ "x": 1 })), ["y"], resolvers!("slow" => slow.clone()), ValueMap::new(), RunOptions::default())
        .expect("Failed to start flow");

    // 1. A second value while the first run is in flight waits in the queue
    flow.supply_result("x", json!(2));
    assert_eq!(flow.running_count(), 1);

    // 2. Once `y` is provided the queued value does not trigger another run
    let results = run.await.expect("Flow failed");
    assert_eq!(results, value_map(json!({ "y": 1 })));
    assert_eq!(*slow.runs.lock().unwrap(), 1);
    assert_eq!(flow.state_code(), FlowStateKind::Finished);
}
