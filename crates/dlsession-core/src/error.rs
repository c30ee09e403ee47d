//! Error types for the coordination core

use crate::engine::EngineError;
use dlsession_types::{ErrorCode, ErrorPayload, Gid, SessionState};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the registry, coordinator and dispatcher
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Download not found: {0}")]
    NotFound(Gid),

    #[error("Cannot {action} download {gid} while it is {state}")]
    IllegalState {
        gid: Gid,
        state: SessionState,
        action: &'static str,
    },

    #[error("Bad arguments: {0}")]
    BadArguments(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether the caller can act on this error and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::NotFound(_) | CoreError::IllegalState { .. })
    }

    /// Stable boundary code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::IllegalState { .. } => ErrorCode::IllegalState,
            CoreError::BadArguments(_) => ErrorCode::BadArgs,
            // An engine that lacks a feature is still an engine failure,
            // not an unknown method
            CoreError::Engine(_)
            | CoreError::Timeout { .. }
            | CoreError::Init(_)
            | CoreError::Serialization(_) => ErrorCode::NativeError,
            CoreError::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::Serialization(error.to_string())
    }
}

impl From<CoreError> for ErrorPayload {
    fn from(error: CoreError) -> Self {
        error.payload()
    }
}
