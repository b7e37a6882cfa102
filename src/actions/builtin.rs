// ABOUTME: Small built-in actions for wiring and testing definitions
// ABOUTME: echo returns its parameters, fail always fails, sleep waits for a duration

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{parse_params, Action, ActionContext, ActionError, Result};

/// Returns its rendered parameters unchanged.
pub struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value> {
        Ok(params)
    }
}

/// Fails with `message`.
pub struct FailAction;

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default = "default_fail_message")]
    message: String,
}

fn default_fail_message() -> String {
    "action failed".to_string()
}

#[async_trait]
impl Action for FailAction {
    fn name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value> {
        let params: FailParams = if params.is_null() {
            FailParams {
                message: default_fail_message(),
            }
        } else {
            parse_params(self.name(), params)?
        };
        Err(ActionError::Failed(params.message))
    }
}

/// Waits for `duration` (e.g. `250ms`) or `ms` milliseconds.
pub struct SleepAction;

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default, with = "humantime_serde")]
    duration: Option<Duration>,
    #[serde(default)]
    ms: Option<u64>,
}

impl SleepParams {
    fn delay(&self) -> Option<Duration> {
        self.duration.or(self.ms.map(Duration::from_millis))
    }
}

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &str {
        "sleep"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        let parsed: SleepParams = parse_params(self.name(), params.clone())?;
        if parsed.delay().is_none() {
            return Err(ActionError::invalid_params(
                self.name(),
                "either 'duration' or 'ms' is required",
            ));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value> {
        let params: SleepParams = parse_params(self.name(), params)?;
        let delay = params.delay().unwrap_or_default();

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(json!({ "slept_ms": delay.as_millis() as u64 })),
        }
    }
}
