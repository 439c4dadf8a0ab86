//! Typed errors for loop construction and execution contexts.
//!
//! Effect failures never show up here: they are absorbed at the feedback
//! boundary and end the failing branch instead.

use thiserror::Error;

/// Errors raised while configuring or starting a loop.
#[derive(Debug, Error)]
pub enum LoopError {
    /// No tokio runtime is running on the calling thread
    #[error("no tokio runtime available to derive an execution context from")]
    NoRuntime,

    /// The builder was finished without a reducer
    #[error("a loop needs exactly one reducer")]
    MissingReducer,

    /// Feedbacks were appended after the loop was started
    #[error("loop already started; its feedbacks are frozen")]
    AlreadyStarted,

    /// An environment value could not be parsed
    #[error("invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },

    /// A dedicated execution context could not be brought up
    #[error("failed to start execution context: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Result type alias for loop operations.
pub type Result<T> = std::result::Result<T, LoopError>;
