//! Error types and handling
//!
//! Common error types used across the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid options: {0}")]
    Options(String),

    #[error("Invalid session state: {0}")]
    State(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

impl EngineError {
    pub fn format(msg: impl Into<String>) -> Self {
        EngineError::Format(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        EngineError::Auth(msg.into())
    }

    pub fn options(msg: impl Into<String>) -> Self {
        EngineError::Options(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        EngineError::State(msg.into())
    }

    pub fn capture(msg: impl Into<String>) -> Self {
        EngineError::Capture(msg.into())
    }
}

/// Error response for embedding in reports and logs
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for ErrorResponse {
    fn from(error: &EngineError) -> Self {
        let code = match error {
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Format(_) => "FORMAT_ERROR",
            EngineError::Auth(_) => "AUTH_ERROR",
            EngineError::Options(_) => "OPTION_ERROR",
            EngineError::State(_) => "STATE_ERROR",
            EngineError::Capture(_) => "CAPTURE_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using EngineError
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_codes() {
        let err = EngineError::auth("wrong password");
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.code, "AUTH_ERROR");
        assert!(resp.message.contains("wrong password"));
    }

    #[test]
    fn io_error_converts() {
        fn open_missing() -> EngineResult<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here")?)
        }
        let resp = ErrorResponse::from(&open_missing().unwrap_err());
        assert_eq!(resp.code, "IO_ERROR");
    }
}
