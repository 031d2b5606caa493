//! Plate text recognition.
//!
//! Three ways to read a plate crop are supported, selected by
//! [`RecognitionMode`]. The default is [`RecognitionMode::RawFrame`]: the
//! fallback engine reads the unprocessed crop.

mod plate_model;
mod preprocess;

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

pub use plate_model::PlateModelRecognizer;
pub use preprocess::{normalize_text, preprocess_for_ocr};

/// Text read from one plate crop. Empty text is a valid result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: Option<f32>,
}

impl Recognition {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Opaque text recognition capability.
pub trait TextRecognizer: Send {
    fn name(&self) -> &'static str;

    fn recognize(&mut self, image: &RgbImage) -> Result<Recognition>;
}

/// Recognizer that never reads anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyRecognizer;

impl TextRecognizer for EmptyRecognizer {
    fn name(&self) -> &'static str {
        "none"
    }

    fn recognize(&mut self, _image: &RgbImage) -> Result<Recognition> {
        Ok(Recognition::empty())
    }
}

/// Which engine reads a plate crop, and on what input.
///
/// `ProcessedFrame` and `RawFrame` use the fallback engine given to
/// [`PlateReader::new`]. When the daemon has an OCR model configured, that
/// fallback is the same character model `OcrModel` uses, so the three modes
/// then differ only in how the crop is preprocessed. Without an OCR model
/// the fallback reads nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Character-detection model on the plate crop.
    OcrModel,
    /// Fallback engine on a grayscale, equalized, thresholded crop.
    ProcessedFrame,
    /// Fallback engine on the crop as captured.
    #[default]
    RawFrame,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::OcrModel => "ocr_model",
            RecognitionMode::ProcessedFrame => "processed_frame",
            RecognitionMode::RawFrame => "raw_frame",
        }
    }
}

impl fmt::Display for RecognitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecognitionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ocr_model" => Ok(RecognitionMode::OcrModel),
            "processed_frame" => Ok(RecognitionMode::ProcessedFrame),
            "raw_frame" => Ok(RecognitionMode::RawFrame),
            other => Err(anyhow!(
                "unknown recognition mode '{}' (expected ocr_model, processed_frame or raw_frame)",
                other
            )),
        }
    }
}

/// Reads a plate crop with the engine the configured mode selects.
pub struct PlateReader {
    mode: RecognitionMode,
    ocr_model: Option<Box<dyn TextRecognizer>>,
    fallback: Box<dyn TextRecognizer>,
}

impl PlateReader {
    pub fn new(mode: RecognitionMode, fallback: Box<dyn TextRecognizer>) -> Self {
        Self {
            mode,
            ocr_model: None,
            fallback,
        }
    }

    pub fn with_ocr_model(mut self, recognizer: Box<dyn TextRecognizer>) -> Self {
        self.ocr_model = Some(recognizer);
        self
    }

    pub fn mode(&self) -> RecognitionMode {
        self.mode
    }

    pub fn read(&mut self, crop: &RgbImage) -> Result<Recognition, StageError> {
        let raw = match self.mode {
            RecognitionMode::OcrModel => {
                let engine = self.ocr_model.as_mut().ok_or_else(|| {
                    StageError::Recognition("ocr_model mode without a loaded ocr model".into())
                })?;
                engine.recognize(crop)
            }
            RecognitionMode::ProcessedFrame => self.fallback.recognize(&preprocess_for_ocr(crop)),
            RecognitionMode::RawFrame => self.fallback.recognize(crop),
        }
        .map_err(|err| StageError::Recognition(format!("{:#}", err)))?;

        Ok(Recognition {
            text: normalize_text(&raw.text),
            confidence: raw.confidence,
        })
    }
}
