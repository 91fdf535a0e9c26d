//! Error taxonomy shared by every component and the numeric codes exposed
//! across the C boundary.

use std::fmt;

use crate::engine::EngineError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("concurrency limit exceeded ({active}/{limit} active sessions)")]
    ConcurrencyLimitExceeded { active: usize, limit: usize },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("model switch already in progress")]
    AlreadyInProgress,

    #[error("backend unstable: {0}")]
    Unstable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl From<EngineError> for BackendError {
    fn from(err: EngineError) -> Self {
        BackendError::Runtime(err.to_string())
    }
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            BackendError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            BackendError::ConcurrencyLimitExceeded { .. } => ErrorCode::ConcurrencyLimitExceeded,
            BackendError::Timeout(_) => ErrorCode::Timeout,
            BackendError::Runtime(_) => ErrorCode::RuntimeError,
            BackendError::AlreadyInProgress => ErrorCode::AlreadyInProgress,
            BackendError::Unstable(_) => ErrorCode::Unstable,
            BackendError::NotFound(_) => ErrorCode::NotFound,
            BackendError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Discrete status codes returned by every fallible C entry point.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidArgument = 1,
    InvalidEncoding = 2,
    Timeout = 3,
    RuntimeError = 4,
    UnsupportedOperation = 5,
    TooLarge = 6,
    NotFound = 7,
    ResourceExhausted = 100,
    ConcurrencyLimitExceeded = 101,
    AlreadyInProgress = 102,
    Unstable = 103,
    Cancelled = 104,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::Success,
        ErrorCode::InvalidArgument,
        ErrorCode::InvalidEncoding,
        ErrorCode::Timeout,
        ErrorCode::RuntimeError,
        ErrorCode::UnsupportedOperation,
        ErrorCode::TooLarge,
        ErrorCode::NotFound,
        ErrorCode::ResourceExhausted,
        ErrorCode::ConcurrencyLimitExceeded,
        ErrorCode::AlreadyInProgress,
        ErrorCode::Unstable,
        ErrorCode::Cancelled,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| *code as u32 == raw)
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::InvalidEncoding => "invalid encoding (expected UTF-8)",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::RuntimeError => "runtime error in the inference engine",
            ErrorCode::UnsupportedOperation => "unsupported operation",
            ErrorCode::TooLarge => "output does not fit in the provided buffer",
            ErrorCode::NotFound => "session, task or graph not found",
            ErrorCode::ResourceExhausted => "session or queue capacity exhausted",
            ErrorCode::ConcurrencyLimitExceeded => "too many concurrently active sessions",
            ErrorCode::AlreadyInProgress => "a model switch is already in progress",
            ErrorCode::Unstable => "backend unstable: model switch and restore both failed",
            ErrorCode::Cancelled => "task was cancelled before it started",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Message lookup keyed by raw code; unknown codes get a generic text.
pub fn error_message(raw: u32) -> &'static str {
    ErrorCode::from_raw(raw)
        .map(ErrorCode::message)
        .unwrap_or("unknown error code")
}
