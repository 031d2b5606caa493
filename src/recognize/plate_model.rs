use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::DetectionStage;

use super::{Recognition, TextRecognizer};

/// Reads a plate by detecting its characters and joining their labels
/// left to right.
pub struct PlateModelRecognizer {
    stage: DetectionStage,
}

impl PlateModelRecognizer {
    pub fn new(stage: DetectionStage) -> Self {
        Self { stage }
    }
}

impl TextRecognizer for PlateModelRecognizer {
    fn name(&self) -> &'static str {
        "plate_model"
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Recognition> {
        let mut chars = self
            .stage
            .detect(image)
            .map_err(|err| anyhow!("character detection failed: {}", err))?;
        if chars.is_empty() {
            return Ok(Recognition::empty());
        }
        chars.sort_by(|a, b| a.bbox.x_min.total_cmp(&b.bbox.x_min));

        let text: String = chars.iter().map(|c| c.label.as_str()).collect();
        let confidence = chars.iter().map(|c| c.score).sum::<f32>() / chars.len() as f32;
        Ok(Recognition {
            text,
            confidence: Some(confidence),
        })
    }
}
