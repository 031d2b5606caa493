//! Per-stage error kinds.
//!
//! The orchestrator never catches arbitrary failures: every stage reports one
//! of these kinds and the frame state machine decides what happens next.

use thiserror::Error;

use crate::detect::DecodeError;

#[derive(Debug, Error)]
pub enum StageError {
    /// The frame source returned nothing or a malformed frame.
    #[error("frame acquisition failed: {0}")]
    Acquisition(String),

    /// The inference capability failed or returned something unusable.
    #[error("inference on '{model}' failed: {message}")]
    Inference { model: String, message: String },

    /// Raw tensors could not be decoded into detections.
    #[error("decode on '{model}' failed: {source}")]
    Decode {
        model: String,
        #[source]
        source: DecodeError,
    },

    /// The text recognition capability failed.
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// The outbox rejected an insert.
    #[error("outbox write failed: {0}")]
    Storage(String),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Acquisition(_) => "acquisition",
            StageError::Inference { .. } => "inference",
            StageError::Decode { .. } => "decode",
            StageError::Recognition(_) => "recognition",
            StageError::Storage(_) => "storage",
        }
    }
}
