//! JSON-RPC 2.0 envelopes in and out of the normalised request/response types.
//!
//! Servers disagree on small details: numeric or string ids, error objects
//! with or without `data`, a missing `jsonrpc` tag. Everything is folded into
//! [`ToolResponse`] here so the correlation logic sees exactly one shape.

use super::{RpcError, ToolRequest, ToolResponse};
use serde_json::{Value, json};

const INTERNAL_ERROR: i64 = -32603;

#[must_use]
pub fn encode_request(request: &ToolRequest) -> Value {
    let mut envelope = json!({
        "jsonrpc": "2.0",
        "id": request.id,
        "method": request.method,
    });
    if !request.params.is_null() {
        envelope["params"] = request.params.clone();
    }
    envelope
}

/// Encode as a single line without a trailing newline.
#[must_use]
pub fn encode_line(request: &ToolRequest) -> String {
    encode_request(request).to_string()
}

/// Normalise an inbound message. Returns `None` for anything that is not a
/// response: notifications, server-initiated requests, and malformed input.
#[must_use]
pub fn decode_message(message: &Value) -> Option<ToolResponse> {
    let object = message.as_object()?;
    if object.contains_key("method") {
        return None;
    }
    let id = normalize_id(object.get("id")?)?;

    if let Some(error) = object.get("error").filter(|error| !error.is_null()) {
        return Some(ToolResponse {
            id,
            result: Err(decode_error(error)),
        });
    }

    Some(ToolResponse {
        id,
        result: Ok(object.get("result").cloned().unwrap_or(Value::Null)),
    })
}

#[must_use]
pub fn decode_text(text: &str) -> Option<ToolResponse> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => decode_message(&value),
        Err(error) => {
            tracing::debug!(%error, "dropping non-JSON frame");
            None
        }
    }
}

fn normalize_id(id: &Value) -> Option<String> {
    match id {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn decode_error(error: &Value) -> RpcError {
    match error {
        Value::Object(object) => RpcError {
            code: object
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(INTERNAL_ERROR),
            message: object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: object.get("data").cloned(),
        },
        Value::String(message) => RpcError {
            code: INTERNAL_ERROR,
            message: message.clone(),
            data: None,
        },
        other => RpcError {
            code: INTERNAL_ERROR,
            message: other.to_string(),
            data: None,
        },
    }
}
