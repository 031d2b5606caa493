//! Edge license plate pipeline.
//!
//! Camera frames go through a vehicle → plate → text recognition cascade.
//! Candidate plates are compared against the last accepted one and, when they
//! are new, written to a durable outbox. A separate delivery worker drains the
//! outbox to a remote collector.
//!
//! # Module Structure
//!
//! - `detect`: model config, tensor decode + NMS, inference backends, detection stages
//! - `recognize`: plate text recognition capability and OCR preprocessing
//! - `imaging`: letterbox, crops, histogram similarity, JPEG transport encoding
//! - `frame` / `ingest`: frames and frame sources
//! - `pipeline`: per-frame orchestrator and deduplicator
//! - `storage`: the outbox (`lpr_data` table)
//! - `delivery`: collector protocol and the retrying delivery worker
//!
//! The orchestrator and the delivery worker share nothing but the outbox.

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod config;
pub mod delivery;
pub mod detect;
pub mod error;
pub mod frame;
pub mod imaging;
pub mod ingest;
pub mod location;
pub mod logging;
pub mod pipeline;
pub mod recognize;
pub mod storage;

pub use config::PipelineConfig;
pub use delivery::{
    Collector, CollectorResponse, DeliveryError, DeliveryPayload, DeliverySettings,
    DeliveryWorker, HttpCollector, PollOutcome, ResponseStatus,
};
pub use detect::{
    Accelerator, BBox, DecodeError, Detection, DetectionStage, InferenceBackend, InferenceOutput,
    ModelConfig, Postprocessor, Quantization, RawTensor, StubBackend,
};
pub use error::StageError;
pub use frame::Frame;
pub use ingest::FrameSource;
pub use location::Location;
pub use pipeline::{
    DedupState, DedupThresholds, Deduplicator, FrameOutcome, FrameSummary, Orchestrator,
    OrchestratorSettings, OrchestratorStages, Verdict,
};
pub use recognize::{
    EmptyRecognizer, PlateModelRecognizer, PlateReader, Recognition, RecognitionMode,
    TextRecognizer,
};
pub use storage::{
    CandidateRecord, DeliveryStatus, InMemoryOutbox, Outbox, PersistedRecord, RecordFilter,
    SharedOutbox, SqliteOutbox, StatusCounts,
};

/// Returns a unique shared-cache in-memory SQLite URI.
///
/// Every connection opened on the same URI sees the same database, which lets
/// the orchestrator and the delivery worker each hold their own connection in
/// tests exactly as they do against a file in production.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:lpr_outbox_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Local wall-clock timestamp in the outbox format (`YYYYMMDD_HHMMSS`).
pub fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
