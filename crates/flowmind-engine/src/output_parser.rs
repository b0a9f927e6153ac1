//! Structured-output handling for LLM nodes: the JSON schema offered to the
//! model, and parsing of its final answer into declared fields.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::graph::{FieldType, OutputField};
use crate::state::type_name;

/// JSON schema for a node's declared output fields.
pub fn output_schema(fields: &[OutputField]) -> Option<Value> {
    if fields.is_empty() {
        return None;
    }
    let mut properties = Map::new();
    for field in fields {
        let mut property = json!({ "type": field.field_type.schema_type() });
        if let Some(description) = &field.description {
            property["description"] = Value::String(description.clone());
        }
        properties.insert(field.name.clone(), property);
    }
    let required: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    Some(json!({
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

/// Parse the model's final answer into field values, in declaration order.
///
/// Fields already present in `captured` (raw tool output) are taken from
/// there and not expected in the text. A lone `string` field accepts plain
/// text. The error string is meant to be shown back to the model.
pub fn parse_fields(
    fields: &[OutputField],
    text: &str,
    captured: &BTreeMap<String, Value>,
) -> Result<Vec<(String, Value)>, String> {
    let remaining: Vec<&OutputField> = fields
        .iter()
        .filter(|f| !captured.contains_key(&f.name))
        .collect();

    let mut parsed = BTreeMap::new();
    if !remaining.is_empty() {
        let cleaned = strip_code_fences(text);
        let value = extract_json(&cleaned);

        match (remaining.as_slice(), value) {
            ([field], Some(Value::Object(map))) if map.contains_key(&field.name) => {
                parsed.insert(field.name.clone(), coerce(field, &map[&field.name])?);
            }
            ([field], _) if field.field_type == FieldType::String => {
                if cleaned.is_empty() {
                    return Err("the response was empty".to_string());
                }
                parsed.insert(field.name.clone(), Value::String(cleaned.clone()));
            }
            ([field], Some(value)) if !value.is_object() => {
                parsed.insert(field.name.clone(), coerce(field, &value)?);
            }
            (_, Some(Value::Object(map))) => {
                for field in &remaining {
                    let raw = map
                        .get(&field.name)
                        .ok_or_else(|| format!("missing field '{}'", field.name))?;
                    parsed.insert(field.name.clone(), coerce(field, raw)?);
                }
            }
            (_, Some(other)) => {
                return Err(format!("expected a JSON object, got {}", type_name(&other)))
            }
            (_, None) => return Err("the response is not valid JSON".to_string()),
        }
    }

    Ok(fields
        .iter()
        .filter_map(|f| {
            captured
                .get(&f.name)
                .or_else(|| parsed.get(&f.name))
                .map(|v| (f.name.clone(), v.clone()))
        })
        .collect())
}

fn coerce(field: &OutputField, value: &Value) -> Result<Value, String> {
    field.coerce(value).map_err(|(expected, found)| {
        format!("field '{}' should be {expected}, got {found}", field.name)
    })
}

/// Parse JSON, falling back to the outermost `{...}` span in the text.
fn extract_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Strip markdown code fences from text.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```, skipping an optional language tag
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Truncate tool output fed back to the model, preferring a line boundary.
pub fn truncate_for_model(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut = content
        .char_indices()
        .nth(max_chars)
        .map_or(content.len(), |(i, _)| i);
    let head = &content[..cut];
    match head.rfind('\n') {
        Some(nl) if nl > 0 => format!("{}\n[truncated]", &content[..nl]),
        _ => format!("{head}\n[truncated]"),
    }
}
