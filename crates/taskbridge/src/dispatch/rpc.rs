//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes plus the session gate.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const SESSION_NOT_INITIALIZED: i32 = -32002;
}

/// Error object carried in a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(details: impl Into<String>) -> Self {
        Self::new(
            codes::PARSE_ERROR,
            format!("Parse error: {}", details.into()),
        )
    }

    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(
            codes::INVALID_REQUEST,
            format!("Invalid request: {}", details.into()),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            format!("Invalid params: {}", details.into()),
        )
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: {}", details.into()),
        )
    }

    pub fn session_not_initialized() -> Self {
        Self::new(codes::SESSION_NOT_INITIALIZED, "Session not initialized")
    }
}

/// A validated request or notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// `None` for notifications.
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_value(self) -> Value {
        // A struct of strings and Values always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Decoded request body: one message or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Value),
    Batch(Vec<Value>),
}

impl Payload {
    /// Decode a body. Only undecodable JSON fails here; structural problems
    /// are reported per message by `parse_request`.
    pub fn from_slice(body: &[u8]) -> Result<Self, RpcError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| RpcError::parse_error(e.to_string()))?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Batch(items),
            other => Self::Single(other),
        }
    }
}

/// Validate one message.
///
/// On failure returns the request ID when one could be recovered, so the
/// error response can still be correlated.
pub fn parse_request(value: Value) -> Result<RpcRequest, (Value, RpcError)> {
    let Value::Object(mut obj) = value else {
        return Err((
            Value::Null,
            RpcError::invalid_request("request must be an object"),
        ));
    };

    // A null ID carries no correlation, so it is a notification too.
    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(id @ (Value::String(_) | Value::Number(_))) => Some(id),
        Some(_) => {
            return Err((
                Value::Null,
                RpcError::invalid_request("id must be a string or number"),
            ));
        }
    };
    let reply_id = id.clone().unwrap_or(Value::Null);

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => {
            return Err((
                reply_id,
                RpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }
        None => {
            return Err((reply_id, RpcError::invalid_request("missing jsonrpc field")));
        }
    }

    let method = match obj.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        Some(_) => {
            return Err((
                reply_id,
                RpcError::invalid_request("method must be a non-empty string"),
            ));
        }
        None => return Err((reply_id, RpcError::invalid_request("missing method field"))),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Null,
        Some(params @ (Value::Object(_) | Value::Array(_))) => params,
        Some(_) => {
            return Err((
                reply_id,
                RpcError::invalid_request("params must be an object or array"),
            ));
        }
    };

    Ok(RpcRequest { id, method, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_and_notification() {
        let request =
            parse_request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap();
        assert_eq!(request.id, Some(json!(1)));
        assert!(!request.is_notification());
        assert_eq!(request.params, Value::Null);

        let notification = parse_request(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .unwrap();
        assert!(notification.is_notification());

        let null_id =
            parse_request(json!({"jsonrpc": "2.0", "id": null, "method": "initialize"})).unwrap();
        assert!(null_id.is_notification());
    }

    #[test]
    fn rejects_wrong_version_keeping_id() {
        let (id, err) =
            parse_request(json!({"jsonrpc": "1.0", "id": "a", "method": "ping"})).unwrap_err();
        assert_eq!(id, json!("a"));
        assert_eq!(err.code, codes::INVALID_REQUEST);
    }

    #[test]
    fn rejects_non_object_and_bad_id() {
        let (id, err) = parse_request(json!(42)).unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(err.code, codes::INVALID_REQUEST);

        let (_, err) =
            parse_request(json!({"jsonrpc": "2.0", "id": {}, "method": "ping"})).unwrap_err();
        assert!(err.message.contains("id must be"));
    }

    #[test]
    fn rejects_scalar_params() {
        let (_, err) = parse_request(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": "x"}),
        )
        .unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);
    }

    #[test]
    fn payload_shapes() {
        assert!(matches!(Payload::from_slice(b"[]"), Ok(Payload::Batch(v)) if v.is_empty()));
        assert!(matches!(Payload::from_slice(b"{}"), Ok(Payload::Single(_))));

        let err = Payload::from_slice(b"{oops").unwrap_err();
        assert_eq!(err.code, codes::PARSE_ERROR);
    }

    #[test]
    fn error_response_wire_shape() {
        let response = RpcResponse::failure(json!(7), RpcError::session_not_initialized());
        insta::assert_json_snapshot!(response, @r#"
        {
          "jsonrpc": "2.0",
          "id": 7,
          "error": {
            "code": -32002,
            "message": "Session not initialized"
          }
        }
        "#);
    }
}
