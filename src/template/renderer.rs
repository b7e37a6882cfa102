// ABOUTME: Parameter rendering seam used by the engine
// ABOUTME: Renders templated values against a scope and decides condition truthiness

use serde_json::Value;

use super::error::{Result, TemplateError};

/// Renders templated expressions against the bindings and results visible
/// to a node.
pub trait ParameterRenderer: Send + Sync {
    /// Render every string inside `expression`, recursing through arrays
    /// and objects. Other values pass through unchanged.
    fn render(&self, expression: &Value, scope: &Value) -> Result<Value>;

    /// Decide a branch or loop condition.
    fn evaluate(&self, condition: &Value, scope: &Value) -> Result<bool> {
        match condition {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(true)),
            Value::String(_) => Ok(is_truthy(&self.render(condition, scope)?)),
            other => Err(TemplateError::InvalidCondition(format!(
                "expected a boolean, number or template string, got {}",
                other
            ))),
        }
    }
}

/// Truthiness of a rendered value. Strings are compared after trimming, so
/// a template rendering `false`, `0`, `no`, `off`, `null` or nothing is
/// false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "false" | "0" | "null" | "no" | "off")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!(" True ")));
        assert!(is_truthy(&json!(3)));
        assert!(is_truthy(&json!([0])));

        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("  ")));
        assert!(!is_truthy(&json!("False")));
        assert!(!is_truthy(&json!("0")));
        assert!(!is_truthy(&json!("off")));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!({})));
    }
}
