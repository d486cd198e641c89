use std::collections::HashMap;

use minijinja::Environment;
use serde_json::Value;

use crate::types::TemplateVariable;

/// Renders a prompt template, substituting `{{name}}` placeholders from the
/// supplied values and falling back to each variable's declared default.
pub fn render_template(
    content: &str,
    variables: &[TemplateVariable],
    values: &serde_json::Map<String, Value>,
) -> Result<String, String> {
    let mut ctx = HashMap::<String, String>::new();
    for var in variables {
        ctx.insert(var.name.clone(), var.default_value.clone());
    }
    for (key, value) in values {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        ctx.insert(key.clone(), text);
    }

    let mut env = Environment::new();
    env.add_template("prompt", content)
        .map_err(|err| format!("invalid template: {err}"))?;
    let template = env
        .get_template("prompt")
        .map_err(|err| format!("invalid template: {err}"))?;
    template
        .render(&ctx)
        .map_err(|err| format!("template render failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(name: &str, default_value: &str) -> TemplateVariable {
        TemplateVariable {
            name: name.to_string(),
            description: String::new(),
            default_value: default_value.to_string(),
            variable_type: "text".to_string(),
            options: vec![],
        }
    }

    #[test]
    fn renders_supplied_values() {
        let values = json!({ "keyword": "crm software" });
        let out = render_template(
            "Write a brief about {{keyword}}.",
            &[var("keyword", "")],
            values.as_object().expect("object"),
        )
        .expect("render");
        assert_eq!(out, "Write a brief about crm software.");
    }

    #[test]
    fn missing_values_fall_back_to_defaults() {
        let values = serde_json::Map::new();
        let out = render_template(
            "Tone: {{tone}}. Topic: {{topic}}.",
            &[var("tone", "friendly"), var("topic", "launch")],
            &values,
        )
        .expect("render");
        assert_eq!(out, "Tone: friendly. Topic: launch.");
    }

    #[test]
    fn non_string_values_are_stringified() {
        let values = json!({ "count": 3 });
        let out = render_template(
            "Generate {{count}} variants.",
            &[var("count", "1")],
            values.as_object().expect("object"),
        )
        .expect("render");
        assert_eq!(out, "Generate 3 variants.");
    }

    #[test]
    fn invalid_template_is_an_error() {
        let values = serde_json::Map::new();
        assert!(render_template("{% broken", &[], &values).is_err());
    }
}
