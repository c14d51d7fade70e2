//! Template transforms for resolver params.
//!
//! A transform is any JSON structure. Every string leaf is rendered with
//! minijinja against the values the task consumed; everything else is kept
//! as is. A leaf that consists of a single `{{ expr }}` keeps the typed value
//! of the expression instead of its string rendering:
//!
//! ```json
//! { "fullName": "{{ first }} {{ last }}", "age": "{{ person.age }}", "tags": ["{{ tag }}", "x"] }
//! ```

use anyhow::{Result, anyhow};
use minijinja::Environment;
use serde_json::Value;
use crate::runtime::ValueMap;

pub fn apply_transform(template: &Value, values: &ValueMap) -> Result<Value> {
    let env = Environment::new();
    let ctx = minijinja::Value::from_serialize(values);
    render_value(&env, template, &ctx)
}

fn render_value(env: &Environment, template: &Value, ctx: &minijinja::Value) -> Result<Value> {
    match template {
        Value::String(s) => render_string(env, s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(env, item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                rendered.insert(k.clone(), render_value(env, v, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(env: &Environment, template: &str, ctx: &minijinja::Value) -> Result<Value> {
    if let Some(expr) = single_expression(template) {
        let compiled = env
            .compile_expression(expr)
            .map_err(|e| anyhow!("Invalid transform expression '{}': {}", expr, e))?;
        let result = compiled
            .eval(ctx.clone())
            .map_err(|e| anyhow!("Failed to evaluate transform expression '{}': {}", expr, e))?;
        if result.is_undefined() {
            return Ok(Value::Null);
        }
        return serde_json::to_value(&result)
            .map_err(|e| anyhow!("Transform expression '{}' produced a non-JSON value: {}", expr, e));
    }

    if !template.contains("{{") && !template.contains("{%") {
        return Ok(Value::String(template.to_string()));
    }

    env.render_str(template, ctx.clone())
        .map(Value::String)
        .map_err(|e| anyhow!("Failed to render transform template '{}': {}", template, e))
}

/// Returns the inner expression when the whole string is one `{{ ... }}`.
fn single_expression(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
