// ABOUTME: Command action running external processes and shell scripts
// ABOUTME: Captures exit code, stdout and stderr and kills the child when the node is cancelled

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{parse_params, Action, ActionContext, ActionError, Result};

pub struct CommandAction;

/// Parameters for the `command` action.
///
/// Supports two modes:
/// 1. Simple command: `command` + `args`
/// 2. Script mode: `script`, run with `shell -c`
///
/// ```yaml
/// type: action
/// action: command
/// params:
///   script: |
///     echo "building {{region}}"
///     make -j4
///   env:
///     CI: "true"
///   expected_exit_codes: [0, 2]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParams {
    /// Program to execute. Mutually exclusive with `script`.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for `command`, ignored in script mode
    #[serde(default)]
    pub args: Vec<String>,

    /// Shell script body. Mutually exclusive with `command`.
    #[serde(default)]
    pub script: Option<String>,

    /// Interpreter for script mode (default: sh)
    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Exit codes considered successful (default: [0])
    #[serde(default = "default_exit_codes")]
    pub expected_exit_codes: Vec<i32>,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

impl CommandParams {
    fn check(&self) -> std::result::Result<(), &'static str> {
        match (&self.command, &self.script) {
            (None, None) => Err("either 'command' or 'script' must be provided"),
            (Some(_), Some(_)) => Err("cannot specify both 'command' and 'script'"),
            (Some(cmd), None) if cmd.trim().is_empty() => Err("command cannot be empty"),
            (None, Some(script)) if script.trim().is_empty() => Err("script cannot be empty"),
            (None, Some(_)) if self.shell.trim().is_empty() => {
                Err("shell cannot be empty in script mode")
            }
            _ => Ok(()),
        }
    }

    fn build(&self) -> Command {
        let mut cmd = match (&self.command, &self.script) {
            (_, Some(script)) => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(script);
                cmd
            }
            (Some(command), None) => {
                let mut cmd = Command::new(command);
                cmd.args(&self.args);
                cmd
            }
            // Rejected by `check`
            (None, None) => Command::new(&self.shell),
        };

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Action for CommandAction {
    fn name(&self) -> &str {
        "command"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        let parsed: CommandParams = parse_params(self.name(), params.clone())?;
        parsed
            .check()
            .map_err(|message| ActionError::invalid_params(self.name(), message))
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value> {
        let params: CommandParams = parse_params(self.name(), params)?;
        params
            .check()
            .map_err(|message| ActionError::invalid_params(self.name(), message))?;

        match (&params.command, &params.script) {
            (Some(command), _) => info!("Running command for '{}': {} {:?}", ctx.path, command, params.args),
            (None, Some(script)) => {
                info!("Running script for '{}' with {}", ctx.path, params.shell);
                debug!("Script ({} chars): {}", script.len(), script);
            }
            (None, None) => {}
        }

        let child = params.build().spawn()?;
        // Dropping the wait future kills the child.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ActionError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!("Command exited with code {}", exit_code);

        if !params.expected_exit_codes.contains(&exit_code) {
            let detail = stderr.trim();
            return Err(ActionError::Failed(if detail.is_empty() {
                format!(
                    "command exited with unexpected code {} (expected one of {:?})",
                    exit_code, params.expected_exit_codes
                )
            } else {
                format!(
                    "command exited with unexpected code {} (expected one of {:?}): {}",
                    exit_code, params.expected_exit_codes, detail
                )
            }));
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActionContext {
        ActionContext::new("cmd")
    }

    #[tokio::test]
    async fn test_simple_command_execution() {
        let value = CommandAction
            .execute(json!({ "command": "echo", "args": ["hello world"] }), &ctx())
            .await
            .unwrap();
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["stdout"], "hello world\n");
    }

    #[tokio::test]
    async fn test_script_with_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let value = CommandAction
            .execute(
                json!({
                    "script": "echo \"$GREETING\" > out.txt && cat out.txt",
                    "env": { "GREETING": "hi" },
                    "working_dir": dir.path().to_string_lossy(),
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(value["stdout"], "hi\n");
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_unexpected_exit_code_fails() {
        let err = CommandAction
            .execute(json!({ "script": "echo oops >&2; exit 3" }), &ctx())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unexpected code 3"));
        assert!(message.contains("oops"));
    }

    #[tokio::test]
    async fn test_expected_exit_codes() {
        let value = CommandAction
            .execute(
                json!({ "script": "exit 2", "expected_exit_codes": [0, 2] }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(value["exit_code"], 2);
    }

    #[test]
    fn test_validation() {
        assert!(CommandAction.validate_params(&json!({})).is_err());
        assert!(CommandAction
            .validate_params(&json!({ "command": "ls", "script": "ls" }))
            .is_err());
        assert!(CommandAction
            .validate_params(&json!({ "command": "  " }))
            .is_err());
        assert!(CommandAction
            .validate_params(&json!({ "command": "ls" }))
            .is_ok());
        assert!(CommandAction
            .validate_params(&json!({ "command": "ls", "args": "not-a-list" }))
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_long_command() {
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = CommandAction
            .execute(json!({ "command": "sleep", "args": ["10"] }), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
