//! Action Schema
//!
//! The closed vocabulary of things the loop is allowed to do, and the single
//! strict boundary where untrusted model JSON becomes one of them.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Discriminators accepted on the wire, in canonical (upper) case.
pub const ALLOWED_ACTIONS: [&str; 5] = ["CLICK", "TYPE", "WAIT", "ABORT", "NOOP"];

/// Field carrying the discriminator.
pub const TYPE_FIELD: &str = "type";

/// Malformed or out-of-vocabulary action JSON
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation: {reason}")]
pub struct SchemaViolation {
    pub reason: String,
}

impl SchemaViolation {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Variant tag, usable without a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    Type,
    Wait,
    Abort,
    Noop,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Wait,
        ActionKind::Abort,
        ActionKind::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "CLICK",
            ActionKind::Type => "TYPE",
            ActionKind::Wait => "WAIT",
            ActionKind::Abort => "ABORT",
            ActionKind::Noop => "NOOP",
        }
    }

    /// Case-insensitive lookup against the allow-list
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An executable action.
///
/// Serializes to the same wire shape [`parse_strict`] accepts, so a
/// serialized action always re-parses to itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Action {
    Click {
        target: String,
    },
    Type {
        text: String,
    },
    Wait {
        #[serde(rename = "ms")]
        duration_ms: u64,
    },
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Noop {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Abort { .. } => ActionKind::Abort,
            Action::Noop { .. } => ActionKind::Noop,
        }
    }

    pub fn to_wire(&self) -> Value {
        // Serializing a plain enum of strings and integers cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// One-line summary used in prompts and status lines
    pub fn summary(&self) -> String {
        match self {
            Action::Click { target } => format!("CLICK \"{}\"", target),
            Action::Type { text } => format!("TYPE \"{}\"", text),
            Action::Wait { duration_ms } => format!("WAIT {}ms", duration_ms),
            Action::Abort { reason } => match reason {
                Some(r) => format!("ABORT ({})", r),
                None => "ABORT".into(),
            },
            Action::Noop { reason } => match reason {
                Some(r) => format!("NOOP ({})", r),
                None => "NOOP".into(),
            },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Strictly parse an untyped JSON value into an [`Action`].
///
/// Pure: never coerces an unknown discriminator into a known one.
pub fn parse_strict(raw: &Value) -> Result<Action, SchemaViolation> {
    let obj = raw
        .as_object()
        .ok_or_else(|| SchemaViolation::new(format!("expected a JSON object, got {}", json_kind(raw))))?;

    let discriminator = match obj.get(TYPE_FIELD) {
        None => return Err(SchemaViolation::new("missing \"type\" field")),
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(SchemaViolation::new(format!(
                "\"type\" must be a string, got {}",
                json_kind(other)
            )))
        }
    };

    let kind = ActionKind::parse(discriminator).ok_or_else(|| {
        SchemaViolation::new(format!(
            "\"{}\" is not one of {}",
            discriminator,
            ALLOWED_ACTIONS.join("|")
        ))
    })?;

    let why = optional_string(obj, "why")?;
    let reason = optional_string(obj, "reason")?;

    match kind {
        ActionKind::Click => {
            let target = required_string(obj, "target")?;
            if target.trim().is_empty() {
                return Err(SchemaViolation::new("CLICK requires a non-empty \"target\""));
            }
            Ok(Action::Click { target })
        }
        ActionKind::Type => Ok(Action::Type {
            text: required_string(obj, "text")?,
        }),
        ActionKind::Wait => {
            let ms = obj
                .get("ms")
                .ok_or_else(|| SchemaViolation::new("WAIT requires a numeric \"ms\""))?;
            let ms = ms.as_f64().ok_or_else(|| {
                SchemaViolation::new(format!("\"ms\" must be a number, got {}", json_kind(ms)))
            })?;
            if !ms.is_finite() || ms < 0.0 {
                return Err(SchemaViolation::new("\"ms\" must be >= 0"));
            }
            Ok(Action::Wait {
                duration_ms: ms.trunc() as u64,
            })
        }
        ActionKind::Abort => Ok(Action::Abort {
            reason: reason.or(why),
        }),
        ActionKind::Noop => Ok(Action::Noop {
            reason: reason.or(why),
        }),
    }
}

/// Parse model text: trimmed, with at most one enclosing markdown fence removed.
pub fn parse_strict_str(raw: &str) -> Result<Action, SchemaViolation> {
    parse_strict(&decode_str(raw)?)
}

/// The JSON value inside model text, before any schema check
pub fn decode_str(raw: &str) -> Result<Value, SchemaViolation> {
    let body = strip_fence(raw.trim());
    serde_json::from_str(body).map_err(|e| SchemaViolation::new(format!("not valid JSON: {}", e)))
}

/// Reads the optional `why` rationale from an action object already accepted
/// by [`parse_strict`].
pub fn rationale(raw: &Value) -> Option<String> {
    raw.get("why")
        .or_else(|| raw.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Human/model-readable description of the accepted JSON shape
pub fn describe_schema() -> String {
    format!(
        r#"Return exactly ONE JSON object. The "type" field must be one of: {}.
Shapes:
  {{"type": "CLICK", "target": "<exact visible text to click>", "why": "<optional>"}}
  {{"type": "TYPE", "text": "<text to type>", "why": "<optional>"}}
  {{"type": "WAIT", "ms": <milliseconds, >= 0>, "why": "<optional>"}}
  {{"type": "ABORT", "reason": "<optional>"}}
  {{"type": "NOOP", "reason": "<optional>"}}
Any other "type" is rejected. "why" and "reason" must be strings when present."#,
        ALLOWED_ACTIONS.join(", ")
    )
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an info string such as ```json
    match inner.find('\n') {
        Some(idx) if !inner[..idx].contains('{') => inner[idx + 1..].trim(),
        _ => inner.trim(),
    }
}

fn required_string(obj: &Map<String, Value>, field: &str) -> Result<String, SchemaViolation> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(SchemaViolation::new(format!(
            "\"{}\" must be a string, got {}",
            field,
            json_kind(other)
        ))),
        None => Err(SchemaViolation::new(format!("missing \"{}\" field", field))),
    }
}

fn optional_string(obj: &Map<String, Value>, field: &str) -> Result<Option<String>, SchemaViolation> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SchemaViolation::new(format!(
            "\"{}\" must be a string, got {}",
            field,
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
