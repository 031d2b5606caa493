use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{InferenceBackend, InferenceOutput};
use crate::detect::postprocess::RawTensor;
use crate::detect::result::Detection;

/// Scripted backend for testing and for running the daemon without a model.
///
/// Queued responses are consumed first, one per call; after that every call
/// returns the fallback response.
pub struct StubBackend {
    queued: VecDeque<Result<InferenceOutput, String>>,
    fallback: Result<InferenceOutput, String>,
}

impl StubBackend {
    /// Always returns no detections.
    pub fn new() -> Self {
        Self::with_detections(Vec::new())
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: Ok(InferenceOutput::Detections(detections)),
        }
    }

    pub fn with_tensors(tensors: Vec<RawTensor>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: Ok(InferenceOutput::RawTensors(tensors)),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: Err(message.into()),
        }
    }

    /// Queue one response ahead of the fallback.
    pub fn then(mut self, response: Result<InferenceOutput, String>) -> Self {
        self.queued.push_back(response);
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _image: &RgbImage) -> Result<InferenceOutput> {
        let response = match self.queued.pop_front() {
            Some(response) => response,
            None => self.fallback.clone(),
        };
        response.map_err(|message| anyhow!(message))
    }
}
