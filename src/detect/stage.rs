use std::sync::Arc;

use image::RgbImage;

use crate::error::StageError;
use crate::imaging;

use super::accelerator::Accelerator;
use super::backend::InferenceOutput;
use super::model_config::{ConfigError, ModelConfig};
use super::postprocess::Postprocessor;
use super::result::Detection;

/// One detection model bound to the shared accelerator.
///
/// Letterboxes the input to the model size, runs the model, decodes raw heads
/// when the backend does not return structured detections, and maps every box
/// back into the pixel space of the image it was given.
pub struct DetectionStage {
    model: String,
    accelerator: Arc<Accelerator>,
    postprocessor: Postprocessor,
}

impl DetectionStage {
    pub fn new(
        model: impl Into<String>,
        accelerator: Arc<Accelerator>,
        config: ModelConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            model: model.into(),
            accelerator,
            postprocessor: Postprocessor::new(config)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &ModelConfig {
        self.postprocessor.config()
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, StageError> {
        let cfg = self.postprocessor.config();
        let (src_w, src_h) = image.dimensions();
        if src_w == 0 || src_h == 0 {
            return Err(StageError::Inference {
                model: self.model.clone(),
                message: "empty input image".to_string(),
            });
        }
        let prepared = imaging::letterbox(image, cfg.input_width, cfg.input_height);

        let output = self
            .accelerator
            .run(&self.model, &prepared.image)
            .map_err(|err| StageError::Inference {
                model: self.model.clone(),
                message: format!("{:#}", err),
            })?;

        let detections = match output {
            InferenceOutput::Detections(detections) => detections,
            InferenceOutput::RawTensors(tensors) => {
                self.postprocessor
                    .decode(&tensors)
                    .map_err(|source| StageError::Decode {
                        model: self.model.clone(),
                        source,
                    })?
            }
        };

        Ok(detections
            .into_iter()
            .map(|det| Detection {
                bbox: prepared.to_source(&det.bbox, src_w, src_h),
                ..det
            })
            .filter(|det| det.bbox.is_valid())
            .collect())
    }
}
