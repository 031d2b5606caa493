//! Suppression of repeated plates.
//!
//! The deduplicator holds no state of its own. The orchestrator owns the
//! single [`DedupState`] and updates it only after an accepted candidate has
//! been persisted.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::imaging::histogram_correlation;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupThresholds {
    /// Reject when the text ratio is strictly above this.
    pub text_threshold: f32,
    /// Reject when the image correlation is strictly above this.
    pub image_threshold: f32,
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            text_threshold: 0.85,
            image_threshold: 0.90,
        }
    }
}

/// The last accepted plate.
#[derive(Clone, Debug, Default)]
pub struct DedupState {
    last_text: Option<String>,
    last_image: Option<RgbImage>,
}

impl DedupState {
    pub fn is_empty(&self) -> bool {
        self.last_text.is_none() && self.last_image.is_none()
    }

    pub fn last_text(&self) -> Option<&str> {
        self.last_text.as_deref()
    }

    pub fn update(&mut self, text: &str, image: &RgbImage) {
        self.last_text = Some(text.to_string());
        self.last_image = Some(image.clone());
    }

    pub fn clear(&mut self) {
        self.last_text = None;
        self.last_image = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Similarity {
    pub text: f32,
    pub image: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(Similarity),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Deduplicator {
    thresholds: DedupThresholds,
}

impl Deduplicator {
    pub fn new(thresholds: DedupThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> DedupThresholds {
        self.thresholds
    }

    pub fn similarity(&self, text: &str, image: &RgbImage, state: &DedupState) -> Similarity {
        let text_sim = match state.last_text.as_deref() {
            Some(prev) if !prev.is_empty() => text_similarity(text, prev),
            _ => 0.0,
        };
        let image_sim = state
            .last_image
            .as_ref()
            .map(|prev| histogram_correlation(image, prev))
            .unwrap_or(0.0);
        Similarity {
            text: text_sim,
            image: image_sim,
        }
    }

    /// On `Accept` the caller must update `state` with this candidate.
    pub fn decide(&self, text: &str, image: &RgbImage, state: &DedupState) -> Verdict {
        if state.is_empty() {
            return Verdict::Accept;
        }
        let sim = self.similarity(text, image, state);
        if sim.text > self.thresholds.text_threshold || sim.image > self.thresholds.image_threshold {
            Verdict::Reject(sim)
        } else {
            Verdict::Accept
        }
    }
}

/// Normalized indel similarity: `(|a| + |b| - d) / (|a| + |b|)` where `d` is
/// the insert/delete edit distance.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    // Indel distance is |a| + |b| - 2 * LCS.
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let lcs = prev[b.len()];
    (2 * lcs) as f32 / total as f32
}
