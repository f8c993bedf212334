//! `{{step_id.field}}` templates used by data mappings and predicates.
//!
//! The validator parses templates statically to check that the referenced
//! step and output field exist; the coordinator resolves them at run time
//! against accumulated step outputs.

use crate::error::{EngineError, EngineResult};
use crate::types::StepId;
use std::collections::HashMap;

/// A parsed `{{step_id.field}}` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub step_id: StepId,
    pub field: String,
}

/// Parse a mapping source template. Returns None when the input is not of
/// the `{{step_id.field}}` shape.
pub fn parse_output_ref(source: &str) -> Option<OutputRef> {
    let inner = source.trim().strip_prefix("{{")?.strip_suffix("}}")?.trim();
    let (step, field) = inner.split_once('.')?;
    let step = step.trim();
    let field = field.trim();
    if step.is_empty() || field.is_empty() || field.contains('.') {
        return None;
    }
    Some(OutputRef {
        step_id: StepId::new(step),
        field: field.to_string(),
    })
}

/// Resolve a template against accumulated step outputs.
pub fn resolve(
    source: &str,
    outputs: &HashMap<StepId, serde_json::Value>,
) -> EngineResult<serde_json::Value> {
    let output_ref = parse_output_ref(source)
        .ok_or_else(|| EngineError::Template(format!("malformed template: {}", source)))?;

    let step_output = outputs.get(&output_ref.step_id).ok_or_else(|| {
        EngineError::Template(format!(
            "no output recorded for step {}",
            output_ref.step_id
        ))
    })?;

    step_output
        .get(&output_ref.field)
        .cloned()
        .ok_or_else(|| {
            EngineError::Template(format!(
                "step {} output has no field {}",
                output_ref.step_id, output_ref.field
            ))
        })
}

/// Render a parameter string, replacing every embedded `{{step.field}}`
/// occurrence with the resolved value. Non-template text passes through.
pub fn render(
    input: &str,
    outputs: &HashMap<StepId, serde_json::Value>,
) -> EngineResult<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            return Err(EngineError::Template(format!(
                "unterminated template in: {}",
                input
            )));
        };
        result.push_str(&rest[..start]);
        let placeholder = &rest[start..start + end + 2];
        let value = resolve(placeholder, outputs)?;
        match value {
            serde_json::Value::String(s) => result.push_str(&s),
            other => result.push_str(&other.to_string()),
        }
        rest = &rest[start + end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> HashMap<StepId, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            StepId::new("fetch"),
            serde_json::json!({"status": "urgent", "count": 7}),
        );
        map
    }

    #[test]
    fn test_parse_valid_ref() {
        let parsed = parse_output_ref("{{fetch.status}}").unwrap();
        assert_eq!(parsed.step_id, StepId::new("fetch"));
        assert_eq!(parsed.field, "status");

        // Whitespace tolerated
        let parsed = parse_output_ref("{{ fetch.status }}").unwrap();
        assert_eq!(parsed.field, "status");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_output_ref("fetch.status").is_none());
        assert!(parse_output_ref("{{fetch}}").is_none());
        assert!(parse_output_ref("{{.status}}").is_none());
        assert!(parse_output_ref("{{fetch.a.b}}").is_none());
        assert!(parse_output_ref("{{fetch.status").is_none());
    }

    #[test]
    fn test_resolve() {
        let value = resolve("{{fetch.status}}", &outputs()).unwrap();
        assert_eq!(value, serde_json::json!("urgent"));

        let value = resolve("{{fetch.count}}", &outputs()).unwrap();
        assert_eq!(value, serde_json::json!(7));
    }

    #[test]
    fn test_resolve_missing_step_or_field() {
        assert!(matches!(
            resolve("{{other.status}}", &outputs()),
            Err(EngineError::Template(_))
        ));
        assert!(matches!(
            resolve("{{fetch.missing}}", &outputs()),
            Err(EngineError::Template(_))
        ));
    }

    #[test]
    fn test_render_mixed_text() {
        let rendered = render("priority={{fetch.status}} n={{fetch.count}}", &outputs()).unwrap();
        assert_eq!(rendered, "priority=urgent n=7");

        let rendered = render("no templates here", &outputs()).unwrap();
        assert_eq!(rendered, "no templates here");
    }

    #[test]
    fn test_render_unterminated() {
        assert!(render("bad {{fetch.status", &outputs()).is_err());
    }
}
