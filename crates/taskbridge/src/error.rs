//! Error types shared across the wire and handler layers.
//!
//! Layer-specific errors live next to the layer that raises them
//! (`BrokerError` in broker, `RpcError` in dispatch, `ConfigError` in config).

/// A frame that could not be turned into a valid request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unexpected message type '{0}', expected 'command_request'")]
    UnexpectedType(String),

    #[error("frame exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
}

/// Failure reported by the work handler itself.
///
/// Always surfaced to callers as `success: false` with this message, never
/// as a transport fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
