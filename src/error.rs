//! Error types for the flash-and-run workflow

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::server::TeardownStep;

/// Main error type for debug server and session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebugError {
    #[error("Debug backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    #[error("Session configuration not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Session configuration {path} is invalid: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Target not found in session configuration: {0}")]
    TargetNotFound(String),

    #[error("Unknown session option: {0}")]
    UnknownOption(String),

    #[error("Invalid value '{value}' for session option {name}")]
    InvalidOptionValue { name: String, value: String },

    #[error("Connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Executable image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("Executable image {path} has an invalid format: {reason}")]
    ImageFormatInvalid { path: PathBuf, reason: String },

    #[error("Memory write failed while loading {path}: {reason}")]
    MemoryWriteFailed { path: PathBuf, reason: String },

    #[error("Resume of {target} failed: {reason}")]
    ResumeFailed { target: String, reason: String },

    #[error("Halt of {target} failed: {reason}")]
    HaltFailed { target: String, reason: String },

    #[error("Teardown step '{step}' failed: {reason}")]
    TeardownFailed { step: TeardownStep, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DebugError {
    /// Process exit status reported for this error.
    ///
    /// Related failures share a code; every category in the table differs.
    pub fn exit_code(&self) -> u8 {
        match self {
            DebugError::InvalidConfig(_) => 2,
            DebugError::BackendUnavailable { .. } => 10,
            DebugError::OperationTimeout(_) => 11,
            DebugError::ConfigNotFound(_) | DebugError::ConfigInvalid { .. } => 12,
            DebugError::TargetNotFound(_) => 13,
            DebugError::UnknownOption(_) | DebugError::InvalidOptionValue { .. } => 14,
            DebugError::ConnectionFailed { .. } => 15,
            DebugError::ImageNotFound(_)
            | DebugError::ImageFormatInvalid { .. }
            | DebugError::MemoryWriteFailed { .. } => 16,
            DebugError::ResumeFailed { .. } | DebugError::HaltFailed { .. } => 17,
            DebugError::TeardownFailed { .. } => 18,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DebugError>;
