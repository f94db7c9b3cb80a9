//! Flat, JSON-compatible payload representation and serde helpers.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::codec::CodecError;

/// Key → value mapping persisted for every event.
///
/// Values are restricted to what JSON can express: null, booleans, numbers,
/// strings, arrays and nested objects.
pub type Payload = serde_json::Map<String, JsonValue>;

/// Serialize `value` into a payload via serde.
///
/// Fails with `MalformedPayload` if the value does not serialize to a JSON
/// object (e.g. a bare number or a unit struct).
pub fn to_payload<T>(type_tag: &str, value: &T) -> Result<Payload, CodecError>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(CodecError::malformed(
            type_tag,
            format!("expected an object payload, got {}", kind_of(&other)),
        )),
        Err(e) => Err(CodecError::malformed(type_tag, e.to_string())),
    }
}

/// Deserialize a payload into `T` via serde.
///
/// Missing or mistyped fields surface as `MalformedPayload`.
pub fn from_payload<T>(type_tag: &str, payload: Payload) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    serde_json::from_value(JsonValue::Object(payload))
        .map_err(|e| CodecError::malformed(type_tag, e.to_string()))
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
