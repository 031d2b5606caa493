use anyhow::Result;
use image::RgbImage;

use super::postprocess::RawTensor;
use super::result::Detection;

/// What an inference call hands back.
///
/// Coordinates of structured detections are in the pixel space of the image
/// the backend was given (the model input, after letterboxing).
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceOutput {
    Detections(Vec<Detection>),
    RawTensors(Vec<RawTensor>),
}

/// Opaque inference capability.
///
/// Implementations receive an image already letterboxed to the model input
/// size. They must not retain the pixels past the `infer` call.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on one prepared image.
    fn infer(&mut self, image: &RgbImage) -> Result<InferenceOutput>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
