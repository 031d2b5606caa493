//! Per-frame processing: the orchestrator state machine, the deduplicator it
//! consults, and the evidence images it writes for accepted plates.

mod dedup;
mod evidence;
mod orchestrator;

pub use dedup::{text_similarity, DedupState, DedupThresholds, Deduplicator, Similarity, Verdict};
pub use evidence::{EvidencePaths, EvidenceWriter};
pub use orchestrator::{
    FrameOutcome, FrameSummary, Orchestrator, OrchestratorSettings, OrchestratorStages,
    OrchestratorStats,
};
