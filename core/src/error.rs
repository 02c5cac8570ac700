//! Structured error types for gridfill.
//!
//! The taxonomy mirrors how errors are recovered: validation and protocol
//! errors are rejected at the boundary, persistence errors are retried with
//! a debounce, transport errors are handled by reconnecting (client) or
//! dropping the participant (server).

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for gridfill operations
#[derive(Error, Debug)]
pub enum GridfillError {
    // =========================================================================
    // Validation errors — rejected at the boundary, no state mutation
    // =========================================================================
    /// Puzzle name does not match the allowed pattern
    #[error("invalid puzzle name: {0:?}")]
    InvalidName(String),

    /// Document dimensions or grid length out of range
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Update payload with wrong shape or field types
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    // =========================================================================
    // Persistence errors — retried via debounce unless tearing down
    // =========================================================================
    /// Puzzle file missing from the store
    #[error("puzzle not found: {0}")]
    PuzzleNotFound(String),

    /// Temp-write or rename failure during an atomic replace
    #[error("persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Transport / protocol errors
    // =========================================================================
    /// Underlying connection closed or errored
    #[error("transport error: {0}")]
    Transport(String),

    /// Unparseable inbound message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Resilient channel gave up permanently
    #[error("channel failed: {0}")]
    ChannelFailed(String),

    // =========================================================================
    // External error wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GridfillError {
    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence { .. } | Self::Transport(_) => true,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::InvalidName(_)
            | Self::InvalidDocument(_)
            | Self::MalformedUpdate(_)
            | Self::PuzzleNotFound(_)
            | Self::Protocol(_)
            | Self::ChannelFailed(_)
            | Self::Json(_) => false,
        }
    }
}

/// Result type alias using GridfillError
pub type Result<T> = std::result::Result<T, GridfillError>;
