// ABOUTME: Handlebars helpers available in node parameters and conditions
// ABOUTME: Covers JSON serialization, string casing, joins, defaults, timestamps, ids and environment lookups

use chrono::Utc;
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
    RenderError,
};
use serde_json::Value;
use std::env;
use uuid::Uuid;

handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(lower: |s: str| s.to_lowercase());
// Serializes any value so a rendered string can be parsed back, e.g. a
// list of items for a fan-out.
handlebars_helper!(json: |v: Json| v.to_string());

/// `{{timestamp}}` or `{{timestamp "%Y%m%d"}}`: current UTC time.
pub fn timestamp_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%SZ");
    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

pub fn uuid_helper(
    _h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&Uuid::new_v4().to_string())?;
    Ok(())
}

/// `{{env "NAME" "fallback"}}`
pub fn env_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let name = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .ok_or_else(|| RenderError::new("env helper requires a variable name"))?;
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    out.write(&env::var(name).unwrap_or_else(|_| fallback.to_string()))?;
    Ok(())
}

/// `{{default value "fallback"}}`: fallback when the value is missing,
/// null or an empty string.
pub fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let fallback = h
        .param(1)
        .map(|v| v.value())
        .ok_or_else(|| RenderError::new("default helper requires a fallback value"))?;

    let chosen = match h.param(0).map(|v| v.value()) {
        None | Some(Value::Null) => fallback,
        Some(Value::String(s)) if s.is_empty() => fallback,
        Some(value) => value,
    };
    out.write(&display(chosen))?;
    Ok(())
}

/// `{{join items ", "}}`: joins array elements, separator defaults to ",".
pub fn join_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _rc: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let items = h
        .param(0)
        .and_then(|v| v.value().as_array())
        .ok_or_else(|| RenderError::new("join helper requires an array"))?;
    let separator = h.param(1).and_then(|v| v.value().as_str()).unwrap_or(",");

    let joined = items.iter().map(display).collect::<Vec<_>>().join(separator);
    out.write(&joined)?;
    Ok(())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn register_helpers(handlebars: &mut Handlebars) {
    handlebars.register_helper("upper", Box::new(upper));
    handlebars.register_helper("lower", Box::new(lower));
    handlebars.register_helper("json", Box::new(json));
    handlebars.register_helper("timestamp", Box::new(timestamp_helper));
    handlebars.register_helper("uuid", Box::new(uuid_helper));
    handlebars.register_helper("env", Box::new(env_helper));
    handlebars.register_helper("default", Box::new(default_helper));
    handlebars.register_helper("join", Box::new(join_helper));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handlebars() -> Handlebars<'static> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        register_helpers(&mut handlebars);
        handlebars
    }

    #[test]
    fn test_case_helpers() {
        let hb = handlebars();
        let data = json!({ "name": "Trellis" });
        assert_eq!(hb.render_template("{{upper name}}", &data).unwrap(), "TRELLIS");
        assert_eq!(hb.render_template("{{lower name}}", &data).unwrap(), "trellis");
    }

    #[test]
    fn test_json_helper_round_trips_arrays() {
        let hb = handlebars();
        let data = json!({ "results": { "list": [1, "two", { "x": 3 }] } });
        let rendered = hb.render_template("{{json results.list}}", &data).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, json!([1, "two", { "x": 3 }]));
    }

    #[test]
    fn test_join_and_default() {
        let hb = handlebars();
        let data = json!({ "hosts": ["a", "b", 3], "empty": "" });
        assert_eq!(
            hb.render_template("{{join hosts \" \"}}", &data).unwrap(),
            "a b 3"
        );
        assert_eq!(
            hb.render_template("{{default empty \"none\"}}", &data).unwrap(),
            "none"
        );
        assert_eq!(
            hb.render_template("{{default missing \"none\"}}", &data).unwrap(),
            "none"
        );
    }

    #[test]
    fn test_env_and_ids() {
        let hb = handlebars();
        let data = json!({});
        assert_eq!(
            hb.render_template("{{env \"TRELLIS_SURELY_UNSET_VAR\" \"fallback\"}}", &data)
                .unwrap(),
            "fallback"
        );
        assert_eq!(hb.render_template("{{uuid}}", &data).unwrap().len(), 36);
        assert!(!hb.render_template("{{timestamp}}", &data).unwrap().is_empty());
    }
}
