//! Post-recording transcode pipeline.
//!
//! Two layers with distinct capacity concerns: the process pool bounds OS
//! process concurrency with priority preemption, and the queue above it
//! serializes job submission per the whole station.

pub mod pool;
pub mod queue;

pub use pool::EncodeProcessPool;
pub use queue::{EncodeFinished, EncodeQueue};

use thiserror::Error;

/// Encode pipeline errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Encode pool at capacity with no evictable process")]
    ResourceExhausted,

    #[error("Empty transcode command template")]
    EmptyCommand,

    #[error("Transcode mode {0} is not configured")]
    UnknownMode(usize),

    #[error("Source file missing: {0}")]
    SourceMissing(String),

    #[error("Process spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}
