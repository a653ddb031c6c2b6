use crate::error::{KernelError, Result};
use serde_json::Value;
use tera::{Context, Tera};

/// Render a step task.
///
/// `{{ input }}` is the previous output as text and `{{ original }}` the
/// pipeline input as text. `data` and `original_data` expose the same values
/// structurally, for field access such as `{{ data.title }}`.
pub fn render_task(template: &str, input: &Value, original: &Value) -> Result<String> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let mut context = Context::new();
    context.insert("input", &as_text(input));
    context.insert("original", &as_text(original));
    context.insert("data", input);
    context.insert("original_data", original);

    Tera::one_off(template, &context, false)
        .map_err(|error| KernelError::Orchestration(format!("task template: {error}")))
}

/// Strings as-is, everything else as compact JSON.
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
