use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unavailable,
}

/// Error body returned by the local control routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A feed frame that could not be understood. Frames failing with this error
/// are dropped; the session carries on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("{message_type} frame is missing `{field}`")]
    MissingField {
        message_type: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidIncrement { field: &'static str, value: f64 },
}
