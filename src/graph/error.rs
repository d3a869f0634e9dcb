//! Audio graph error types
//!
//! Centralized error handling for graph wiring, boundary buffers and fan components.
//! Exhaustion and end of stream are not errors; they travel through
//! [`ReadOutcome`](crate::graph::ReadOutcome) instead.

use std::fmt;
use thiserror::Error;

/// Result type for audio graph operations
pub type AudioResult<T> = Result<T, AudioError>;

/// Error type for the audio graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    // ─────────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Formats on both sides of a connection differ
    #[error("Audio format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        expected: String,
        actual: String,
    },

    /// A sample format was constructed with invalid parameters
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// A buffer length parameter was zero
    #[error("Invalid buffer length for '{parameter}': {reason}")]
    InvalidBufferLength {
        parameter: String,
        reason: String,
    },

    /// Channel swizzle does not fit the formats it connects
    #[error("Invalid channel swizzle: {0}")]
    InvalidSwizzle(String),

    /// Configuration file or environment problem
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ─────────────────────────────────────────────────────────────────────────────
    // Topology Errors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Connected nodes belong to different graphs
    #[error("Cannot connect '{source_node}' to '{target_node}': nodes belong to different audio graphs")]
    GraphMismatch {
        source_node: String,
        target_node: String,
    },

    /// A boundary component was given the same graph on both sides
    #[error("Input and output graphs of '{0}' must be different")]
    SameGraph(String),

    /// Input connected to a component whose playback already finished
    #[error("Cannot connect a new input to '{0}' after playback has finished")]
    PlaybackFinished(String),

    /// Operation on a disposed node
    #[error("Audio node '{0}' has been disposed")]
    Disposed(String),

    // ─────────────────────────────────────────────────────────────────────────────
    // Direction Errors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Node does not support this direction of data flow
    #[error("'{node}' does not support {operation}")]
    Unsupported {
        node: String,
        operation: &'static str,
    },

    // ─────────────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Caller buffer cannot hold the requested sample count
    #[error("Buffer too small: {required} values required, {actual} provided")]
    BufferTooSmall {
        required: usize,
        actual: usize,
    },

    /// Operation cancelled through its cancellation token
    #[error("Audio operation was cancelled")]
    Cancelled,

    /// Internal error (should not occur in normal operation)
    #[error("Internal audio graph error: {0}")]
    Internal(String),
}

impl AudioError {
    /// Create a format mismatch error
    pub fn format_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::FormatMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an invalid buffer length error
    pub fn buffer_length(parameter: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidBufferLength {
            parameter: parameter.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an unsupported direction error
    pub fn unsupported(node: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            node: node.into(),
            operation,
        }
    }

    /// Check if this error is transient and the call may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error comes from invalid configuration or wiring
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::FormatMismatch { .. }
                | Self::InvalidFormat(_)
                | Self::InvalidBufferLength { .. }
                | Self::InvalidSwizzle(_)
                | Self::Configuration(_)
                | Self::GraphMismatch { .. }
                | Self::SameGraph(_)
        )
    }
}
