// ABOUTME: Handlebars-backed parameter renderer
// ABOUTME: Renders strings recursively through arrays and objects against a node's scope

use handlebars::Handlebars;
use serde_json::{Map, Value};

use super::error::{Result, TemplateError};
use super::helpers;
use super::renderer::ParameterRenderer;

#[derive(Clone)]
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

impl TemplateEngine {
    /// Create a template engine with all built-in helpers
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.set_dev_mode(false);
        // Parameters feed commands and JSON, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        helpers::register_helpers(&mut handlebars);

        Ok(Self { handlebars })
    }

    /// Render a single template string
    pub fn render_template(&self, template: &str, scope: &Value) -> Result<String> {
        self.handlebars
            .render_template(template, scope)
            .map_err(TemplateError::HandlebarsError)
    }

    /// Recursively render templates in a JSON value, including object keys
    pub fn render_value(&self, value: &Value, scope: &Value) -> Result<Value> {
        match value {
            Value::String(s) if self.has_templates(s) => {
                Ok(Value::String(self.render_template(s, scope)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, scope))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = Map::new();
                for (key, val) in obj {
                    let key = if self.has_templates(key) {
                        self.render_template(key, scope)?
                    } else {
                        key.clone()
                    };
                    rendered.insert(key, self.render_value(val, scope)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Validate template syntax without rendering
    pub fn validate_template(&self, template: &str) -> Result<()> {
        handlebars::Template::compile(template)
            .map(|_| ())
            .map_err(|e| TemplateError::SyntaxError(e.to_string()))
    }

    pub fn has_templates(&self, text: &str) -> bool {
        text.contains("{{") && text.contains("}}")
    }

    /// Register a custom helper function
    pub fn register_helper<F>(&mut self, name: &str, helper: F)
    where
        F: handlebars::HelperDef + Send + Sync + 'static,
    {
        self.handlebars.register_helper(name, Box::new(helper));
    }
}

impl ParameterRenderer for TemplateEngine {
    fn render(&self, expression: &Value, scope: &Value) -> Result<Value> {
        self.render_value(expression, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_nested_params() {
        let engine = TemplateEngine::new().unwrap();
        let scope = json!({
            "region": "eu",
            "index": 2,
            "results": { "fetch": { "rows": 10 } }
        });
        let params = json!({
            "target": "{{region}}-{{index}}",
            "args": ["--rows", "{{results.fetch.rows}}", 5],
            "{{region}}_key": true,
            "plain": "no templates <here>"
        });

        let rendered = engine.render(&params, &scope).unwrap();
        assert_eq!(
            rendered,
            json!({
                "target": "eu-2",
                "args": ["--rows", "10", 5],
                "eu_key": true,
                "plain": "no templates <here>"
            })
        );
    }

    #[test]
    fn test_evaluate_conditions() {
        let engine = TemplateEngine::new().unwrap();
        let scope = json!({ "iteration": 2, "mode": "fast", "flag": false });

        assert!(engine.evaluate(&json!(true), &scope).unwrap());
        assert!(!engine.evaluate(&json!(null), &scope).unwrap());
        assert!(engine.evaluate(&json!("{{lt iteration 3}}"), &scope).unwrap());
        assert!(!engine.evaluate(&json!("{{lt iteration 2}}"), &scope).unwrap());
        assert!(engine.evaluate(&json!("{{eq mode \"fast\"}}"), &scope).unwrap());
        assert!(!engine.evaluate(&json!("{{flag}}"), &scope).unwrap());
        assert!(!engine.evaluate(&json!("{{missing}}"), &scope).unwrap());
        assert!(engine.evaluate(&json!([1]), &scope).is_err());
    }

    #[test]
    fn test_template_validation() {
        let engine = TemplateEngine::new().unwrap();
        assert!(engine.validate_template("Hello {{name}}").is_ok());
        assert!(engine.validate_template("Hello {{name}").is_err());
        assert!(engine
            .validate_template("{{#if ready}}go{{else}}wait{{/if}}")
            .is_ok());
    }

    #[test]
    fn test_custom_helper() {
        let mut engine = TemplateEngine::new().unwrap();
        engine.register_helper(
            "double",
            |h: &handlebars::Helper,
             _: &Handlebars,
             _: &handlebars::Context,
             _: &mut handlebars::RenderContext,
             out: &mut dyn handlebars::Output|
             -> handlebars::HelperResult {
                let n = h.param(0).and_then(|v| v.value().as_u64()).unwrap_or(0);
                out.write(&(n * 2).to_string())?;
                Ok(())
            },
        );
        assert_eq!(
            engine.render(&json!("{{double 21}}"), &json!({})).unwrap(),
            json!("42")
        );
    }
}
