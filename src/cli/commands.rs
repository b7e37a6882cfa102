// ABOUTME: Command implementations for the trellis CLI
// ABOUTME: Handles execution of the run and validate commands

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::config::Config;
use crate::actions::ActionRegistry;
use crate::engine::{Engine, NodeRecord, NodeStatus, RunResult};
use crate::parser::{TaskDefinition, WorkflowParser};
use crate::template::TemplateEngine;

/// Options for a single `trellis run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub variables: Map<String, Value>,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
}

async fn load_definition(path: &Path) -> Result<TaskDefinition> {
    WorkflowParser::new()
        .parse_file(path)
        .await
        .with_context(|| format!("Failed to parse task definition {}", path.display()))
}

fn build_engine(config: &Config, max_concurrent: Option<usize>) -> Result<Engine> {
    let mut engine_config = config.to_engine_config();
    if let Some(max) = max_concurrent {
        engine_config = engine_config.with_max_concurrent(max);
    }

    let engine = Engine::new(
        engine_config,
        Arc::new(ActionRegistry::with_builtins()),
        Arc::new(TemplateEngine::new()?),
    )?;
    Ok(engine)
}

/// Run a task definition file to completion
pub async fn run_definition(path: PathBuf, options: RunOptions, config: &Config) -> Result<()> {
    info!("Starting task run: {}", path.display());

    let definition = load_definition(&path).await?;
    info!("Loaded task definition: {}", definition.name);

    let engine = build_engine(config, options.max_concurrent)?;

    if options.dry_run {
        let graph = engine.validate(&definition)?;
        println!(
            "✓ Dry run: '{}' is valid ({} nodes, terminal: {})",
            definition.name,
            graph.total_nodes(),
            graph.terminal_nodes().join(", ")
        );
        return Ok(());
    }

    // Config variables first so `--var` wins.
    let mut bindings = config.variables.clone();
    bindings.extend(options.variables);
    info!("Starting run with {} initial bindings", bindings.len());

    let handle = engine.start(&definition, bindings).await?;
    let token = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    let result = handle.wait().await;
    interrupt.abort();
    let result = result?;

    match &options.output {
        Some(output_path) => {
            let json_content = serde_json::to_string_pretty(&result)
                .context("Failed to serialize run result to JSON")?;
            tokio::fs::write(output_path, json_content)
                .await
                .with_context(|| {
                    format!("Failed to write output file '{}'", output_path.display())
                })?;
            info!("Results written to: {}", output_path.display());
        }
        None => print_summary(&result),
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Run '{}' finished with status: {}",
            result.name,
            result.status
        ))
    }
}

/// Validate a task definition file without running it
pub async fn validate_definition(path: PathBuf, config: &Config) -> Result<()> {
    info!("Validating task definition: {}", path.display());

    let definition = load_definition(&path).await?;
    let engine = build_engine(config, None)?;

    match engine.validate(&definition) {
        Ok(graph) => {
            println!("✓ Task definition '{}' is valid", definition.name);
            println!("  Nodes: {}", graph.total_nodes());
            println!("  Terminal nodes: {}", graph.terminal_nodes().join(", "));
            println!("  Variables: {}", definition.variables.len());
            Ok(())
        }
        Err(errors) => {
            println!("✗ Task definition '{}' is invalid", definition.name);
            for error in errors.iter() {
                println!("  - {}", error);
            }
            Err(anyhow::anyhow!(
                "Validation failed with {} error(s)",
                errors.len()
            ))
        }
    }
}

fn print_summary(result: &RunResult) {
    println!(
        "Run '{}' completed with status: {} ({:.1}s)",
        result.name,
        result.status,
        result.duration().as_secs_f64()
    );
    for record in result.nodes.values() {
        println!("  {}", describe_node(record));
    }
    let summary = &result.summary;
    println!(
        "  {} succeeded, {} failed, {} skipped, {} blocked, {} cancelled",
        summary.succeeded, summary.failed, summary.skipped, summary.blocked, summary.cancelled
    );
}

fn describe_node(record: &NodeRecord) -> String {
    let mut line = format!("{} [{}]: {}", record.node_id, record.kind, record.status);
    match record.status {
        NodeStatus::Failed => {
            if let Some(error) = &record.error {
                line.push_str(&format!(" - {}", error));
            }
        }
        NodeStatus::Skipped => {
            if let Some(reason) = &record.skip_reason {
                if let Ok(Value::Object(map)) = serde_json::to_value(reason) {
                    if let Some(Value::String(kind)) = map.get("reason") {
                        line.push_str(&format!(" ({})", kind));
                    }
                }
            }
        }
        _ => {}
    }
    if record.attempts > 1 {
        line.push_str(&format!(" after {} attempts", record.attempts));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NodeError, SkipReason};

    #[test]
    fn test_describe_failed_node() {
        let mut record = NodeRecord::new("deploy", "action");
        record.mark_failed(
            NodeError::Execution {
                action: "command".to_string(),
                message: "exit 1".to_string(),
            },
            3,
        );
        let line = describe_node(&record);
        assert!(line.starts_with("deploy [action]: failed"));
        assert!(line.contains("exit 1"));
        assert!(line.ends_with("after 3 attempts"));
    }

    #[test]
    fn test_describe_skipped_node() {
        let mut record = NodeRecord::new("rollback", "action");
        record.mark_skipped(SkipReason::BranchNotTaken {
            branch: "route".to_string(),
        });
        assert_eq!(
            describe_node(&record),
            "rollback [action]: skipped (branch_not_taken)"
        );
    }
}
