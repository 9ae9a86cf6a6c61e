//! ABOUTME: Error types and handling for lldbg
//! ABOUTME: Provides the DebugError enum and Result type alias

use thiserror::Error;

/// Comprehensive error enum for all lldbg operations
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("Output sink error: {message}")]
    OutputSink { message: String },

    #[error("Bad command")]
    BadCommand,

    #[error("Command error: {message}")]
    Command { message: String },

    #[error("Source map error: {message}")]
    SourceMap { message: String },

    #[error("Script error: {message}")]
    Script { message: String },

    #[error("Evaluation error: {message}")]
    Eval { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DebugError {
    /// Shorthand for a script-level error carrying a plain message
    #[must_use]
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
        }
    }

    /// Shorthand for an evaluation error carrying a plain message
    #[must_use]
    pub fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, DebugError>;
