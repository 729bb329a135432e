//! Frame decoding shared by every protocol variant.
//!
//! A text frame is either a single JSON object or an array of JSON objects. Each object
//! names its kind through a `type` (PubSub) or `cmd` (Archipelago) field, and servers are
//! not consistent about casing, so the discriminator is normalised to upper case.

use serde_json::Value;

/// A decoded JSON object frame.
pub type JsonObject = serde_json::Map<String, Value>;

/// Errors produced while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Unexpected frame shape: expected object or array of objects, got {0}")]
    UnexpectedShape(&'static str),
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode one text frame into the objects it carries, in wire order.
///
/// An empty array decodes to no objects. Any non-object element rejects the whole frame.
pub fn decode_frames(text: &str) -> Result<Vec<JsonObject>, ProtocolError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(obj) => Ok(vec![obj]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(obj) => Ok(obj),
                other => Err(ProtocolError::UnexpectedShape(shape_of(&other))),
            })
            .collect(),
        other => Err(ProtocolError::UnexpectedShape(shape_of(&other))),
    }
}

/// The upper-cased `type` or `cmd` of a frame, if it has a non-empty one.
pub fn discriminator(obj: &JsonObject) -> Option<String> {
    obj.get("type")
        .or_else(|| obj.get("cmd"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(str::to_uppercase)
}

/// Encode an outbound frame as compact JSON text.
pub fn encode(value: &Value) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}
