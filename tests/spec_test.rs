use flowline::spec::builder::FlowSpecBuilder;
use flowline::spec::loader::{load_flow_spec, load_flow_spec_from_json, load_flow_spec_from_yaml};
use flowline::{value_map, Engine, FlowConfigs, ParamSource, ResolverMap, RunOptions, ValueMap};
use serde_json::json;
use std::fs;

#[test]
fn test_load_yaml_flow_spec() {
    let yaml_content = r#"
tasks:
  greet:
    requires: [name]
    provides: [greeting]
    resolver:
      name: flowline::Echo
      params:
        greeting:
          transform: "Hello {{ name }}!"
  shout:
    requires: [greeting]
    provides: [loud]
    defaultResult: "..."
    resolver:
      name: shout
      params:
        text: greeting
        times:
          value: 3
      results:
        out: loud
configs:
  throwErrorOnUnsolvableResult: true
  maxConcurrency: 4
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("flow.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let loaded = load_flow_spec_from_yaml(&file_path.to_string_lossy()).expect("Failed to load flow spec from YAML");

    let expected = FlowSpecBuilder::new()
        .configs(FlowConfigs {
            throw_error_on_unsolvable_result: true,
            max_concurrency: Some(4),
            ..FlowConfigs::default()
        })
        .task("greet")
            .requires(&["name"])
            .provides(&["greeting"])
            .resolver("flowline::Echo")
            .transform_param("greeting", "Hello {{ name }}!")
            .build()
        .task("shout")
            .requires(&["greeting"])
            .provides(&["loud"])
            .default_result("...")
            .resolver("shout")
            .param("text", "greeting")
            .value_param("times", 3)
            .result("out", "loud")
            .build()
        .build();

    assert_eq!(loaded, expected);
    assert_eq!(
        loaded.tasks["shout"].resolver.as_ref().map(|r| r.params["times"].clone()),
        Some(ParamSource::Literal { value: json!(3) })
    );
}

#[test]
fn test_load_json_flow_spec_by_extension() {
    let json_content = json!({
        "tasks": {
            "only": { "provides": ["x"], "callbacks": ["cb"] }
        }
    });

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("flow.json");
    fs::write(&file_path, json_content.to_string()).expect("Failed to write temp file");

    let by_extension = load_flow_spec(&file_path.to_string_lossy()).expect("Failed to load flow spec");
    let explicit = load_flow_spec_from_json(&file_path.to_string_lossy()).expect("Failed to load flow spec from JSON");

    assert_eq!(by_extension, explicit);
    let only = &by_extension.tasks["only"];
    assert!(only.requires.is_empty());
    assert_eq!(only.callbacks, vec!["cb".to_string()]);
    assert_eq!(only.resolver_name(), "flowline::Noop");
    assert_eq!(by_extension.configs, FlowConfigs::default());
}

#[test]
fn test_load_missing_file_reports_path() {
    let err = load_flow_spec_from_yaml("/definitely/not/here.yaml").expect_err("load should fail");
    assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
}

#[tokio::test]
async fn test_transform_params_are_rendered_against_requirements() {
    let spec = FlowSpecBuilder::new()
        .task("render")
            .requires(&["first", "last", "person"])
            .provides(&["card"])
            .resolver("flowline::Echo")
            .transform_param("card", json!({
                "fullName": "{{ first }} {{ last }}",
                "age": "{{ person.age }}",
                "tags": ["{{ person.tags[0] }}", "static"],
                "missing": "{{ nothing }}",
                "count": 2
            }))
            .build()
        .build();

    let results = Engine::new()
        .run(
            spec,
            value_map(json!({ "first": "Ada", "last": "Lovelace", "person": { "age": 36, "tags": ["math"] } })),
            ["card"],
            ResolverMap::new(),
            ValueMap::new(),
            RunOptions::default(),
        )
        .await
        .expect("Flow failed");

    assert_eq!(
        results["card"],
        json!({
            "fullName": "Ada Lovelace",
            "age": 36,
            "tags": ["math", "static"],
            "missing": null,
            "count": 2
        })
    );
}

#[tokio::test]
async fn test_automapping_can_be_disabled() {
    let configs = FlowConfigs {
        resolver_automap_params: false,
        resolver_automap_results: false,
        ..FlowConfigs::default()
    };

    // Without automapping Echo receives only the explicit param and the
    // identity provision is not picked up.
    let spec = FlowSpecBuilder::new()
        .configs(configs)
        .task("echo")
            .requires(&["a", "b"])
            .provides(&["a", "copy"])
            .resolver("flowline::Echo")
            .param("renamed", "b")
            .result("renamed", "copy")
            .build()
        .build();

    let results = Engine::new()
        .run(spec, value_map(json!({ "a": 1, "b": 2 })), ["copy"], ResolverMap::new(), ValueMap::new(), RunOptions::default())
        .await
        .expect("Flow failed");

    assert_eq!(results, value_map(json!({ "copy": 2 })));
}

#[tokio::test]
async fn test_run_file() {
    let yaml_content = r#"
tasks:
  double:
    requires: [n]
    provides: [twice]
    resolver:
      name: flowline::Echo
      params:
        twice:
          transform: "{{ n * 2 }}"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("double.yml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let results = Engine::new()
        .run_file(&file_path, value_map(json!({ "n": 21 })), &["twice".to_string()])
        .await
        .expect("Flow failed");
    assert_eq!(results, value_map(json!({ "twice": 42 })));

    let err = Engine::new()
        .run_file(&temp_dir.path().join("missing.yml"), ValueMap::new(), &[])
        .await
        .expect_err("missing file should fail");
    assert!(format!("{:#}", err).contains("missing.yml"));
}
