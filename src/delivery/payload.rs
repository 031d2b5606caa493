use serde::{Deserialize, Serialize};

use crate::storage::PersistedRecord;

use super::DeliveryError;

/// Collector table every record is delivered into.
pub const PAYLOAD_TABLE: &str = "lpr_detection";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub table: String,
    pub data: PayloadData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    pub license_plate: String,
    pub checkpoint_id: String,
    pub timestamp: String,
    pub hostname: String,
    /// Not classified at the edge; sent as a single space.
    pub vehicle_type: String,
    pub vehicle_color: String,
    pub latitude: String,
    pub longitude: String,
    /// Base64 JPEG, or empty when the image could not be loaded.
    pub image: String,
}

impl DeliveryPayload {
    pub fn build(record: &PersistedRecord, checkpoint_id: &str, image: String) -> Self {
        let rec = &record.record;
        Self {
            table: PAYLOAD_TABLE.to_string(),
            data: PayloadData {
                license_plate: rec.license_text.clone(),
                checkpoint_id: checkpoint_id.to_string(),
                timestamp: rec.timestamp.clone(),
                hostname: rec.hostname.clone(),
                vehicle_type: " ".to_string(),
                vehicle_color: " ".to_string(),
                latitude: rec.location.latitude(),
                longitude: rec.location.longitude(),
                image,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// The collector's reply: `{"status": ..., "message": ...}`. Other keys the
/// collector adds (`record_id`, `table`, `action`) are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectorResponse {
    pub status: ResponseStatus,
    pub message: String,
}

impl CollectorResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
        }
    }

    /// A body without a known status and a message counts as no response.
    pub fn parse(body: &str) -> Result<Self, DeliveryError> {
        serde_json::from_str(body)
            .map_err(|err| DeliveryError::Connection(format!("unexpected response shape: {}", err)))
    }
}
