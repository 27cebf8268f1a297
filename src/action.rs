//! Action schema and validation boundary.
//!
//! Planner output is free-form text believed to contain one action encoded
//! as a JSON object. Nothing is executed until it has been normalized into
//! the closed [`Action`] set by [`validate`]; unknown kinds are rejected
//! rather than ignored, and coordinates are checked against the screen the
//! planner was shown.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default swipe gesture duration (milliseconds)
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 300;

/// Default wait duration (milliseconds)
pub const DEFAULT_WAIT_DURATION_MS: u64 = 1000;

/// One atomic, executable instruction directed at the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Tap at an absolute screen coordinate
    Tap { x: u32, y: u32 },

    /// Swipe from one coordinate to another
    Swipe {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
    },

    /// Type text into the focused input field
    TypeText { text: String },

    /// Press a named key (e.g., "back", "home", "enter")
    KeyEvent { key: String },

    /// Pause before the next observation
    Wait { duration_ms: u64 },

    /// The task is complete; carries the planner's summary
    Done { summary: String },

    /// The planner gave up; carries its reason
    Fail { reason: String },
}

impl Action {
    /// Terminal actions end the run and are never executed on the device
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. } | Action::Fail { .. })
    }

    /// Short kind name, used in filenames and log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::Swipe { .. } => "swipe",
            Action::TypeText { .. } => "type",
            Action::KeyEvent { .. } => "key",
            Action::Wait { .. } => "wait",
            Action::Done { .. } => "done",
            Action::Fail { .. } => "fail",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Tap { x, y } => write!(f, "tap ({}, {})", x, y),
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => write!(f, "swipe ({}, {}) -> ({}, {}) over {}ms", x1, y1, x2, y2, duration_ms),
            Action::TypeText { text } => write!(f, "type {:?}", text),
            Action::KeyEvent { key } => write!(f, "key '{}'", key),
            Action::Wait { duration_ms } => write!(f, "wait {}ms", duration_ms),
            Action::Done { summary } => write!(f, "done: {}", summary),
            Action::Fail { reason } => write!(f, "fail: {}", reason),
        }
    }
}

/// Result type for validation
pub type ValidationResult = Result<Action, ValidationError>;

/// Errors produced while normalizing planner output
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The action tag is not a member of the known set
    UnknownActionType(String),
    /// A required field is absent or of the wrong shape
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    /// A coordinate lies outside the captured screen
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::UnknownActionType(kind) => {
                write!(f, "unknown action type '{}'", kind)
            }
            ValidationError::MissingField { kind, field } => {
                write!(f, "action '{}' is missing field '{}'", kind, field)
            }
            ValidationError::OutOfBounds {
                x,
                y,
                width,
                height,
            } => write!(
                f,
                "coordinate ({}, {}) outside screen bounds {}x{}",
                x, y, width, height
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Normalize raw planner output into a validated [`Action`].
///
/// The raw text may wrap the action JSON in prose or code fences; the
/// first JSON object found is used. Coordinates are validated against the
/// dimensions of the screenshot captured in the same step. Deterministic:
/// the same raw text and dimensions always yield the same result.
pub fn validate(raw: &str, screen_width: u32, screen_height: u32) -> ValidationResult {
    let json_text = extract_json_object(raw).ok_or_else(|| ValidationError::MissingField {
        kind: "action",
        field: "action",
    })?;

    let value: Value = serde_json::from_str(json_text).map_err(|_| ValidationError::MissingField {
        kind: "action",
        field: "action",
    })?;

    let tag = value
        .get("action")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField {
            kind: "action",
            field: "action",
        })?;

    match tag.to_lowercase().as_str() {
        "tap" => {
            let (x, y) =
                coord_pair(&value, "x", "y", "coordinate").ok_or(ValidationError::MissingField {
                    kind: "tap",
                    field: "coordinate",
                })?;
            let (x, y) = check_bounds(x, y, screen_width, screen_height)?;
            Ok(Action::Tap { x, y })
        }
        "swipe" => {
            let (x1, y1) =
                coord_pair(&value, "x1", "y1", "start").ok_or(ValidationError::MissingField {
                    kind: "swipe",
                    field: "start",
                })?;
            let (x2, y2) =
                coord_pair(&value, "x2", "y2", "end").ok_or(ValidationError::MissingField {
                    kind: "swipe",
                    field: "end",
                })?;
            let (x1, y1) = check_bounds(x1, y1, screen_width, screen_height)?;
            let (x2, y2) = check_bounds(x2, y2, screen_width, screen_height)?;
            let duration_ms = int_field(&value, "duration")
                .and_then(|d| u64::try_from(d).ok())
                .unwrap_or(DEFAULT_SWIPE_DURATION_MS);
            Ok(Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            })
        }
        "type" | "type_text" => {
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .ok_or(ValidationError::MissingField {
                    kind: "type",
                    field: "text",
                })?;
            Ok(Action::TypeText {
                text: text.to_string(),
            })
        }
        "key" | "keyevent" => {
            let key = value
                .get("key")
                .and_then(Value::as_str)
                .ok_or(ValidationError::MissingField {
                    kind: "key",
                    field: "key",
                })?;
            Ok(Action::KeyEvent {
                key: key.to_string(),
            })
        }
        "wait" => {
            let duration_ms = int_field(&value, "duration")
                .and_then(|d| u64::try_from(d).ok())
                .unwrap_or(DEFAULT_WAIT_DURATION_MS);
            Ok(Action::Wait { duration_ms })
        }
        "done" | "finish" => {
            let summary = text_field(&value, &["summary", "message"]).ok_or(
                ValidationError::MissingField {
                    kind: "done",
                    field: "summary",
                },
            )?;
            Ok(Action::Done { summary })
        }
        "fail" => {
            let reason = text_field(&value, &["reason", "message"]).ok_or(
                ValidationError::MissingField {
                    kind: "fail",
                    field: "reason",
                },
            )?;
            Ok(Action::Fail { reason })
        }
        other => Err(ValidationError::UnknownActionType(other.to_string())),
    }
}

/// Extract the first balanced JSON object from free-form text.
///
/// Tracks string literals so braces inside text fields don't unbalance
/// the scan.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read an integer field, accepting integer or float JSON numbers
fn int_field(value: &Value, key: &str) -> Option<i64> {
    let v = value.get(key)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

/// Read a coordinate pair either from flat fields or a two-element array
fn coord_pair(value: &Value, x_key: &str, y_key: &str, array_key: &str) -> Option<(i64, i64)> {
    if let (Some(x), Some(y)) = (int_field(value, x_key), int_field(value, y_key)) {
        return Some((x, y));
    }
    let arr = value.get(array_key)?.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let num = |v: &Value| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64));
    Some((num(&arr[0])?, num(&arr[1])?))
}

/// Read the first present string field from a list of accepted keys
fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Reject coordinates outside the screen the planner was shown
fn check_bounds(
    x: i64,
    y: i64,
    width: u32,
    height: u32,
) -> Result<(u32, u32), ValidationError> {
    if x < 0 || y < 0 || x >= i64::from(width) || y >= i64::from(height) {
        return Err(ValidationError::OutOfBounds {
            x,
            y,
            width,
            height,
        });
    }
    Ok((x as u32, y as u32))
}
