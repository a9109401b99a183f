//! Error types for the tunerec control channel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors that can occur during communication.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Invalid magic bytes in frame header.
    #[error("Invalid magic bytes: expected 'TREC', got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Frame payload is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// Failed to decode the JSON payload.
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Underlying transport error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Operation succeeded.
    Success,
    /// A reservation for this program already exists.
    Duplicate,
    /// The reservation cannot be placed on any tuner.
    Conflict,
    /// A scheduling pass (or the encode queue) is busy; retry later.
    Busy,
    /// Referenced entity does not exist.
    NotFound,
    /// The request itself is malformed (e.g. an invalid rule pattern).
    BadRequest,
    /// Encode pool at capacity with nothing evictable.
    ResourceExhausted,
    /// Unclassified server-side failure.
    Internal,
}

impl ErrorCode {
    /// Returns true if this code indicates success.
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}
