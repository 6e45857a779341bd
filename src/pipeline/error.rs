//! Pipeline-specific error types.

use crate::pipeline::id::ConnectionId;
use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Cycle detected in pipeline graph")]
    CycleDetected,

    #[error("Unknown connection {0:?}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Connection '{connection}' already has a writer ({existing}); '{requested}' rejected")]
    DuplicateProducer {
        connection: String,
        existing: String,
        requested: String,
    },

    #[error("Envelope is not bound to a weak heap")]
    HeapNotAssigned,

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
