//! Captured frames.

use chrono::{DateTime, Local};
use image::RgbImage;

use crate::TIMESTAMP_FORMAT;

/// One captured camera frame.
///
/// Frames are processed one at a time and dropped when the cycle ends; only
/// the evidence images of an accepted record outlive them.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic per-source counter, used to correlate log lines.
    pub id: u64,
    pub captured_at: DateTime<Local>,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self {
            id,
            captured_at: Local::now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// A frame with no pixels is malformed.
    pub fn is_valid(&self) -> bool {
        self.width() > 0 && self.height() > 0
    }

    /// Capture time as `YYYYMMDD_HHMMSS`.
    pub fn timestamp_label(&self) -> String {
        self.captured_at.format(TIMESTAMP_FORMAT).to_string()
    }
}
