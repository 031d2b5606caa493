//! Tensor decode for distribution-regression detection heads.
//!
//! Each feature level emits a class-score head `(cells, num_classes[+1])` and a
//! box-regression head `(cells, 4 * (reg_max + 1))`. Box sides are decoded as
//! the expected value of a softmax over `reg_max + 1` distance bins, scaled by
//! the level stride and applied to the cell's prior.

use ndarray::{s, Array2, ArrayView1};
use thiserror::Error;

use super::model_config::{ConfigError, ModelConfig};
use super::nms::non_max_suppression;
use super::result::{BBox, Detection};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("tensor shape {shape:?} needs {expected} values, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("tensor shape {0:?} has no channel dimension")]
    Rank(Vec<usize>),

    #[error("no feature level has {cells} cells (levels: {levels:?})")]
    UnknownLevel { cells: usize, levels: Vec<usize> },

    #[error("class head has {channels} channels, expected {expected} or {}", expected + 1)]
    ClassChannels { channels: usize, expected: usize },

    #[error("stride {stride} level is missing its {head} head")]
    MissingHead { stride: u32, head: &'static str },

    #[error("stride {stride} level received a second {head} head")]
    DuplicateHead { stride: u32, head: &'static str },
}

/// Dequantization parameters of one output tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: f32,
}

impl Quantization {
    pub const IDENTITY: Quantization = Quantization {
        scale: 1.0,
        zero_point: 0.0,
    };

    pub fn new(scale: f32, zero_point: f32) -> Self {
        Self { scale, zero_point }
    }

    pub fn dequantize(&self, raw: f32) -> f32 {
        (raw - self.zero_point) * self.scale
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U16(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dequantize(&self, q: Quantization) -> Vec<f32> {
        match self {
            TensorData::U8(v) => v.iter().map(|&x| q.dequantize(x as f32)).collect(),
            TensorData::I8(v) => v.iter().map(|&x| q.dequantize(x as f32)).collect(),
            TensorData::U16(v) => v.iter().map(|&x| q.dequantize(x as f32)).collect(),
            TensorData::F32(v) => v.iter().map(|&x| q.dequantize(x)).collect(),
        }
    }
}

/// One raw model output head, exactly as the accelerator hands it over.
#[derive(Clone, Debug, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
    pub quantization: Quantization,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, data: TensorData, quantization: Quantization) -> Self {
        Self {
            shape,
            data,
            quantization,
        }
    }

    pub fn f32(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self::new(shape, TensorData::F32(data), Quantization::IDENTITY)
    }

    pub fn u8(shape: Vec<usize>, data: Vec<u8>, quantization: Quantization) -> Self {
        Self::new(shape, TensorData::U8(data), quantization)
    }

    /// Dequantize into `(cells, channels)`; every leading dimension folds into cells.
    fn to_matrix(&self) -> Result<Array2<f32>, DecodeError> {
        let Some(&channels) = self.shape.last() else {
            return Err(DecodeError::Rank(self.shape.clone()));
        };
        let expected: usize = self.shape.iter().product();
        if channels == 0 || expected != self.data.len() {
            return Err(DecodeError::ShapeMismatch {
                shape: self.shape.clone(),
                expected,
                actual: self.data.len(),
            });
        }
        let values = self.data.dequantize(self.quantization);
        Array2::from_shape_vec((expected / channels, channels), values).map_err(|_| {
            DecodeError::ShapeMismatch {
                shape: self.shape.clone(),
                expected,
                actual: self.data.len(),
            }
        })
    }
}

/// Reference point of one feature-map cell, in input pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prior {
    pub x: f32,
    pub y: f32,
    pub stride: f32,
}

#[derive(Clone, Debug)]
struct Level {
    stride: u32,
    cells: usize,
    offset: usize,
}

/// Pure decode + NMS. Priors are generated once at construction.
#[derive(Clone, Debug)]
pub struct Postprocessor {
    config: ModelConfig,
    levels: Vec<Level>,
    priors: Vec<Prior>,
}

impl Postprocessor {
    pub fn new(config: ModelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut levels = Vec::with_capacity(config.strides.len());
        let mut priors = Vec::new();
        for &stride in &config.strides {
            let feat_h = config.input_height / stride;
            let feat_w = config.input_width / stride;
            levels.push(Level {
                stride,
                cells: (feat_h * feat_w) as usize,
                offset: priors.len(),
            });
            for y in 0..feat_h {
                for x in 0..feat_w {
                    priors.push(Prior {
                        x: (x * stride) as f32,
                        y: (y * stride) as f32,
                        stride: stride as f32,
                    });
                }
            }
        }
        Ok(Self {
            config,
            levels,
            priors,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn priors(&self) -> &[Prior] {
        &self.priors
    }

    /// Decode one frame's raw heads.
    ///
    /// Any shape problem fails the whole call; no partial detections are returned.
    /// Output is grouped by class, score-descending within a class.
    pub fn decode(&self, tensors: &[RawTensor]) -> Result<Vec<Detection>, DecodeError> {
        let heads = self.assign_heads(tensors)?;
        let bins = self.config.bins();
        let num_classes = self.config.num_classes;
        let width = self.config.input_width as f32;
        let height = self.config.input_height as f32;

        let mut boxes = Vec::with_capacity(self.priors.len());
        let mut scores = Array2::<f32>::zeros((self.priors.len(), num_classes));

        for (level, (cls, reg)) in self.levels.iter().zip(heads.iter()) {
            for cell in 0..level.cells {
                let index = level.offset + cell;
                let prior = self.priors[index];
                let row = reg.row(cell);
                let mut distance = [0.0f32; 4];
                for (side, d) in distance.iter_mut().enumerate() {
                    *d = integral(row.slice(s![side * bins..(side + 1) * bins])) * prior.stride;
                }
                boxes.push(
                    BBox::new(
                        prior.x - distance[0],
                        prior.y - distance[1],
                        prior.x + distance[2],
                        prior.y + distance[3],
                    )
                    .clip(width, height),
                );
                // An extra trailing column is the no-object logit and is dropped.
                scores
                    .row_mut(index)
                    .assign(&cls.slice(s![cell, ..num_classes]));
            }
        }

        let mut detections = Vec::new();
        for class_id in 0..num_classes {
            let candidates: Vec<(BBox, f32)> = boxes
                .iter()
                .zip(scores.column(class_id).iter())
                .filter(|(bbox, &score)| score > self.config.conf_threshold && bbox.is_valid())
                .map(|(bbox, &score)| (*bbox, score))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let label = self.config.label_for(class_id);
            for (bbox, score) in non_max_suppression(candidates, self.config.nms_iou_threshold) {
                detections.push(Detection {
                    bbox,
                    score: score.clamp(0.0, 1.0),
                    class_id,
                    label: label.clone(),
                });
            }
        }
        Ok(detections)
    }

    /// Route each tensor to its feature level by cell count and head kind.
    fn assign_heads(
        &self,
        tensors: &[RawTensor],
    ) -> Result<Vec<(Array2<f32>, Array2<f32>)>, DecodeError> {
        let reg_channels = 4 * self.config.bins();
        let num_classes = self.config.num_classes;
        let mut cls_heads: Vec<Option<Array2<f32>>> = (0..self.levels.len()).map(|_| None).collect();
        let mut reg_heads: Vec<Option<Array2<f32>>> = (0..self.levels.len()).map(|_| None).collect();

        for tensor in tensors {
            let matrix = tensor.to_matrix()?;
            let (cells, channels) = matrix.dim();
            let (slots, head) = if channels == reg_channels {
                (&mut reg_heads, "regression")
            } else if channels == num_classes || channels == num_classes + 1 {
                (&mut cls_heads, "class")
            } else {
                return Err(DecodeError::ClassChannels {
                    channels,
                    expected: num_classes,
                });
            };

            let matching: Vec<usize> = self
                .levels
                .iter()
                .enumerate()
                .filter(|(_, level)| level.cells == cells)
                .map(|(i, _)| i)
                .collect();
            if matching.is_empty() {
                return Err(DecodeError::UnknownLevel {
                    cells,
                    levels: self.levels.iter().map(|l| l.cells).collect(),
                });
            }
            match matching.iter().find(|&&i| slots[i].is_none()) {
                Some(&i) => slots[i] = Some(matrix),
                None => {
                    return Err(DecodeError::DuplicateHead {
                        stride: self.levels[matching[0]].stride,
                        head,
                    })
                }
            }
        }

        self.levels
            .iter()
            .zip(cls_heads.into_iter().zip(reg_heads))
            .map(|(level, heads)| match heads {
                (Some(cls), Some(reg)) => Ok((cls, reg)),
                (None, _) => Err(DecodeError::MissingHead {
                    stride: level.stride,
                    head: "class",
                }),
                (_, None) => Err(DecodeError::MissingHead {
                    stride: level.stride,
                    head: "regression",
                }),
            })
            .collect()
    }
}

/// Expected bin index under a softmax over `logits`.
fn integral(logits: ArrayView1<f32>) -> f32 {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (i, &logit) in logits.iter().enumerate() {
        let p = (logit - max).exp();
        weighted += i as f32 * p;
        total += p;
    }
    if total > 0.0 {
        weighted / total
    } else {
        0.0
    }
}
