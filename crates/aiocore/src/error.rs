//! Error types for the async I/O core

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::CompletionId;

/// Errors reported synchronously by the builder and the completion state machine
///
/// Transport-level failures never surface through these at the call site;
/// they are recorded on the completion as a [`Failure`] and only observed
/// through its terminal phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AioError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Completion {0} has not reached a terminal phase")]
    StillPending(CompletionId),

    #[error("Protocol mismatch: expected {expected} reply entries, got {actual}")]
    ProtocolMismatch { expected: usize, actual: usize },

    #[error("Transport failure {code}: {message}")]
    TransportFailure { code: i32, message: String },

    #[error("Remote error {code}")]
    Remote { code: i32 },

    #[error("Sub-operation {index} aborted by an earlier failure in an ordered batch")]
    Aborted { index: usize },

    #[error("Operation cancelled before submission was acknowledged")]
    Cancelled,

    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<aioconfig::ConfigError> for AioError {
    fn from(e: aioconfig::ConfigError) -> Self {
        AioError::Config(e.to_string())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, AioError>;

/// Terminal failure recorded on a completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// `cancel()` won the race against the acknowledgment
    Cancelled,
    /// No acknowledgment or commit within the operation timeout
    TimedOut(Duration),
    /// The transport could not deliver the request or lost the commit
    Transport { code: i32, message: String },
    /// The remote store rejected the batch (negative overall result)
    Remote { code: i32 },
    /// The reply did not match the submitted batch
    Protocol { expected: usize, actual: usize },
}

impl Failure {
    /// Negative errno value reported as the completion's return value
    pub fn errno(&self) -> i32 {
        match self {
            Failure::Cancelled => errno::ECANCELED,
            Failure::TimedOut(_) => errno::ETIMEDOUT,
            Failure::Transport { code, .. } => normalize_code(*code),
            Failure::Remote { code } => normalize_code(*code),
            Failure::Protocol { .. } => errno::EPROTO,
        }
    }
}

impl From<Failure> for AioError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Cancelled => AioError::Cancelled,
            Failure::TimedOut(d) => AioError::Timeout(d),
            Failure::Transport { code, message } => AioError::TransportFailure { code, message },
            Failure::Remote { code } => AioError::Remote { code },
            Failure::Protocol { expected, actual } => {
                AioError::ProtocolMismatch { expected, actual }
            }
        }
    }
}

/// Error codes are always reported negative
fn normalize_code(code: i32) -> i32 {
    match code {
        0 => errno::EIO,
        c if c > 0 => -c,
        c => c,
    }
}

/// Negative errno values used on the wire and in return values
pub mod errno {
    pub const ENOENT: i32 = -2;
    pub const EIO: i32 = -5;
    pub const EEXIST: i32 = -17;
    pub const EFBIG: i32 = -27;
    pub const EINVAL: i32 = -22;
    pub const ERANGE: i32 = -34;
    pub const ENODATA: i32 = -61;
    pub const EPROTO: i32 = -71;
    pub const EOVERFLOW: i32 = -75;
    pub const EOPNOTSUPP: i32 = -95;
    pub const ETIMEDOUT: i32 = -110;
    pub const ECANCELED: i32 = -125;

    /// cmpext reports a mismatch at offset `n` as `-(MAX_ERRNO + n)`
    pub const MAX_ERRNO: i32 = 4095;
}
