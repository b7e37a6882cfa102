// ABOUTME: End-to-end tests for the trellis engine with real actions
// ABOUTME: Runs definitions from files through command, blocking and built-in actions

use serde_json::{json, Map, Value};
use std::sync::Arc;

use trellis::actions::{ActionError, ActionRegistry};
use trellis::engine::{
    Engine, EngineConfig, ExecutionError, NodeStatus, RequiredBindings, RunStatus,
};
use trellis::parser::WorkflowParser;
use trellis::template::TemplateEngine;

mod common;
use common::{definition, TestEnvironment};

#[tokio::test]
async fn test_pipeline_from_file_with_commands() {
    let env = TestEnvironment::new();
    let out_dir = env.path().to_string_lossy().to_string();
    let yaml = format!(
        r#"
name: pipeline
variables:
  regions: [eu, us]
  out_dir: "{out_dir}"
nodes:
  prepare:
    type: action
    action: command
    params:
      script: "mkdir -p {{{{out_dir}}}}/build && echo ready"
  build:
    type: parallel_for_each
    depends_on: prepare
    items: "{{{{json regions}}}}"
    as: region
    template:
      - id: compile
        type: action
        action: command
        params:
          script: "echo {{{{region}}}} > {{{{out_dir}}}}/build/{{{{region}}}}.txt && echo built-{{{{region}}}}"
  summary:
    type: action
    action: echo
    depends_on: build
    params:
      prepared: "{{{{results.prepare.stdout}}}}"
"#
    );
    let path = env.write_file("pipeline.yaml", &yaml).await;

    let definition = WorkflowParser::new().parse_file(&path).await.unwrap();
    let engine = Engine::with_defaults().unwrap();
    let result = engine.run(&definition, Map::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.failures());
    assert!(env.path().join("build/eu.txt").exists());
    assert!(env.path().join("build/us.txt").exists());

    let outputs = result.get_node("build").unwrap().result.clone().unwrap();
    let stdout: Vec<&str> = outputs
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["stdout"].as_str().unwrap().trim())
        .collect();
    assert_eq!(stdout, vec!["built-eu", "built-us"]);

    let summary = result.get_node("summary").unwrap().result.clone().unwrap();
    assert_eq!(summary["prepared"].as_str().unwrap().trim(), "ready");
    assert_eq!(result.summary.succeeded, 3);
    assert_eq!(result.summary.success_rate, 100.0);
}

#[tokio::test]
async fn test_failing_command_reports_stderr() {
    let engine = Engine::with_defaults().unwrap();
    let def = definition(
        r#"
name: broken_build
nodes:
  compile:
    type: action
    action: command
    params: { script: "echo 'missing header' >&2; exit 2" }
  ship: { type: action, action: echo, depends_on: compile }
"#,
    );

    let result = engine.run(&def, Map::new()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    let (node, error) = result.first_failure().unwrap();
    assert_eq!(node, "compile");
    assert!(error.to_string().contains("missing header"));
    assert!(result.get_node("ship").unwrap().is_blocked());

    let serialized = serde_json::to_value(&result).unwrap();
    assert_eq!(serialized["status"], "failed");
    assert_eq!(serialized["nodes"]["compile"]["error"]["kind"], "execution");
    assert_eq!(serialized["nodes"]["ship"]["skip_reason"]["reason"], "blocked");
}

#[tokio::test]
async fn test_blocking_action_and_guarded_cleanup() {
    let mut registry = ActionRegistry::with_builtins();
    registry.register_blocking("checksum", |params: Value| {
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::invalid_params("checksum", "'text' is required"))?;
        let sum: u32 = text.bytes().map(u32::from).sum();
        Ok(json!({ "sum": sum }))
    });
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(registry),
        Arc::new(TemplateEngine::new().unwrap()),
    )
    .unwrap();

    let def = definition(
        r#"
name: verify
nodes:
  guard:
    type: guarded
    body:
      - { id: digest, type: action, action: checksum, params: { text: abc } }
      - { id: compare, type: action, action: fail, params: { message: "sum was {{results.digest.sum}}" } }
    recovery:
      - { id: explain, type: action, action: echo, params: { why: "{{error.message}}" } }
    always:
      - { id: tidy, type: action, action: echo, params: { done: true } }
"#,
    );

    let result = engine.run(&def, Map::new()).await.unwrap();
    assert!(result.is_success());
    let value = result.get_node("guard").unwrap().result.clone().unwrap();
    assert!(value["why"].as_str().unwrap().contains("sum was 294"));
}

#[tokio::test]
async fn test_planner_requires_bindings() {
    let engine = Engine::with_defaults()
        .unwrap()
        .with_planner(Arc::new(RequiredBindings::new(["release"])));
    let def = definition(
        r#"
name: release
nodes:
  tag: { type: action, action: echo, params: { release: "{{release}}" } }
"#,
    );

    match engine.run(&def, Map::new()).await {
        Err(ExecutionError::PlannerError(message)) => assert!(message.contains("release")),
        other => panic!("expected planner error, got {:?}", other.map(|r| r.status)),
    }

    let mut bindings = Map::new();
    bindings.insert("release".to_string(), json!("1.2.0"));
    let result = engine.run(&def, bindings).await.unwrap();
    assert_eq!(
        result.get_node("tag").unwrap().result,
        Some(json!({ "release": "1.2.0" }))
    );
}

#[tokio::test]
async fn test_nested_resource_tags_do_not_deadlock() {
    let engine = Engine::new(
        EngineConfig::default().with_max_concurrent(1).with_pool("db", 1),
        Arc::new(ActionRegistry::with_builtins()),
        Arc::new(TemplateEngine::new().unwrap()),
    )
    .unwrap();
    let def = definition(
        r#"
name: nested
nodes:
  migrate:
    type: sequence
    resources: [db]
    steps:
      - { id: lock, type: action, action: sleep, params: { ms: 10 } }
      - { id: apply, type: action, action: sleep, params: { ms: 10 } }
  backup:
    type: action
    action: sleep
    resources: [db]
    params: { ms: 10 }
"#,
    );

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        engine.run(&def, Map::new()),
    )
    .await
    .expect("nested admission should not deadlock")
    .unwrap();
    assert!(result.is_success());
    assert_eq!(result.status_of("migrate"), Some(NodeStatus::Success));
    assert_eq!(engine.admission().in_use("db"), 0);
}

#[tokio::test]
async fn test_unknown_action_fails_node() {
    let engine = Engine::with_defaults().unwrap();
    let def = definition(
        r#"
name: typo
nodes:
  oops: { type: action, action: ecko }
"#,
    );

    let result = engine.run(&def, Map::new()).await.unwrap();
    assert_eq!(result.status_of("oops"), Some(NodeStatus::Failed));
    assert!(result
        .first_failure()
        .unwrap()
        .1
        .to_string()
        .contains("ecko"));
}
