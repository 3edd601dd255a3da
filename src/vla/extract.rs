//! Best-effort JSON extraction from free-form model text.
//!
//! Local models wrap JSON in prose and code fences. This finds the first
//! well-formed object or array in the text. It is only used where a lossy
//! read is acceptable; executable actions always go through
//! [`parse_strict`](super::action::parse_strict).

use serde_json::Value;

/// First well-formed JSON object or array in `text`, fenced blocks first
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_blocks(text)
        .into_iter()
        .find_map(first_value)
        .or_else(|| first_value(text))
}

/// Scan for the first `{` or `[` that starts a complete JSON value
fn first_value(text: &str) -> Option<Value> {
    for (idx, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }
    None
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    text.split("```")
        .skip(1)
        .step_by(2)
        .map(|block| match block.find('\n') {
            Some(idx) if !block[..idx].contains(['{', '[']) => &block[idx + 1..],
            _ => block,
        })
        .collect()
}

/// Strings from a JSON array, or from the first array-valued field of an object.
///
/// Array items may be plain strings or objects with a textual field.
pub fn string_list(value: &Value, keys: &[&str]) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match keys
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .or_else(|| map.values().find_map(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => ["step", "action", "description", "text", "question"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}
