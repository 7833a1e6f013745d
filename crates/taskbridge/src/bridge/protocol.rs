//! Wire protocol types for the coordinator channel.
//!
//! One request shape travels client -> server, one response shape travels
//! back. Both carry the `task_id` that correlates them and an ISO-8601
//! timestamp.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current time as an RFC 3339 / ISO-8601 string.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    CommandRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    CommandResponse,
    CommandError,
}

/// Request from a front-end to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub task_id: String,
    pub user_request: String,
    #[serde(default = "now_iso8601")]
    pub timestamp: String,
}

impl CommandRequest {
    pub fn new(task_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::CommandRequest,
            task_id: task_id.into(),
            user_request: user_request.into(),
            timestamp: now_iso8601(),
        }
    }
}

/// Response from the coordinator. `task_id` always echoes the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub task_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default = "now_iso8601")]
    pub timestamp: String,
}

impl CommandResponse {
    pub fn success(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::CommandResponse,
            task_id: task_id.into(),
            success: true,
            message: message.into(),
            timestamp: now_iso8601(),
        }
    }

    pub fn failure(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::CommandError,
            task_id: task_id.into(),
            success: false,
            message: message.into(),
            timestamp: now_iso8601(),
        }
    }
}

/// A request frame that failed validation.
///
/// Keeps whatever `task_id` could be recovered so the error response still
/// correlates with the caller's request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRejection {
    pub task_id: String,
    pub error: ProtocolError,
}

impl RequestRejection {
    fn new(task_id: Option<&str>, error: ProtocolError) -> Self {
        Self {
            task_id: task_id.unwrap_or_default().to_string(),
            error,
        }
    }

    pub fn into_response(self) -> CommandResponse {
        CommandResponse::failure(self.task_id, format!("Invalid request: {}", self.error))
    }
}

/// Parse and validate one request frame body.
///
/// Requires `type == "command_request"`, a non-empty string `task_id`, and a
/// string `user_request`. `timestamp` is optional.
pub fn parse_request(body: &[u8]) -> Result<CommandRequest, RequestRejection> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RequestRejection::new(None, ProtocolError::MalformedJson(e.to_string())))?;

    let obj = value
        .as_object()
        .ok_or_else(|| RequestRejection::new(None, ProtocolError::NotAnObject))?;

    let task_id = match obj.get("task_id") {
        None | Some(serde_json::Value::Null) => {
            return Err(RequestRejection::new(
                None,
                ProtocolError::MissingField("task_id"),
            ));
        }
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.as_str(),
        Some(_) => {
            return Err(RequestRejection::new(
                None,
                ProtocolError::InvalidField {
                    field: "task_id",
                    expected: "non-empty string",
                },
            ));
        }
    };
    let reject = |error| RequestRejection::new(Some(task_id), error);

    match obj.get("type") {
        None | Some(serde_json::Value::Null) => {
            return Err(reject(ProtocolError::MissingField("type")));
        }
        Some(serde_json::Value::String(t)) if t == "command_request" => {}
        Some(serde_json::Value::String(t)) => {
            return Err(reject(ProtocolError::UnexpectedType(t.clone())));
        }
        Some(_) => {
            return Err(reject(ProtocolError::InvalidField {
                field: "type",
                expected: "string",
            }));
        }
    }

    let user_request = match obj.get("user_request") {
        None | Some(serde_json::Value::Null) => {
            return Err(reject(ProtocolError::MissingField("user_request")));
        }
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(reject(ProtocolError::InvalidField {
                field: "user_request",
                expected: "string",
            }));
        }
    };

    let timestamp = obj
        .get("timestamp")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .unwrap_or_else(now_iso8601);

    Ok(CommandRequest {
        kind: RequestKind::CommandRequest,
        task_id: task_id.to_string(),
        user_request,
        timestamp,
    })
}
