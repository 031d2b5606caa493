//! Delivery of outbox records to the remote collector.
//!
//! The worker runs independently of the orchestrator and shares nothing with
//! it except the outbox.

mod collector;
mod payload;
mod worker;

use thiserror::Error;

pub use collector::{Collector, HttpCollector};
pub use payload::{CollectorResponse, DeliveryPayload, PayloadData, ResponseStatus, PAYLOAD_TABLE};
pub use worker::{Backoff, DeliverySettings, DeliveryStats, DeliveryWorker, PollOutcome};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    /// The collector answered `status: error`.
    #[error("collector rejected record: {0}")]
    Rejected(String),

    /// No well-formed answer within the timeout.
    #[error("collector unreachable: {0}")]
    Connection(String),
}
