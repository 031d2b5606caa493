use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_REG_MAX: usize = 16;
const DEFAULT_CONF_THRESHOLD: f32 = 0.3;
const DEFAULT_NMS_THRESHOLD: f32 = 0.6;
const DEFAULT_NUM_CLASSES: usize = 80;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid model config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model config is missing {0}")]
    Missing(&'static str),

    #[error("invalid model config: {0}")]
    Invalid(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    #[serde(rename = "PRE_PROCESS", default)]
    pre_process: Vec<PreProcessSection>,
    #[serde(rename = "POST_PROCESS", default)]
    post_process: Vec<PostProcessSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct PreProcessSection {
    input_h: Option<u32>,
    input_w: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct PostProcessSection {
    strides: Option<Vec<u32>>,
    reg_max: Option<usize>,
    output_conf_threshold: Option<f32>,
    #[serde(rename = "OutputNMSThreshold")]
    output_nms_threshold: Option<f32>,
    output_num_classes: Option<usize>,
    labels_path: Option<PathBuf>,
    labels: Option<HashMap<String, String>>,
}

/// Static decode configuration of one detection model.
///
/// Built once at model-load time from the model's JSON blob. A missing stride
/// list or label table is a construction error, never a per-frame one.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub strides: Vec<u32>,
    pub reg_max: usize,
    pub conf_threshold: f32,
    pub nms_iou_threshold: f32,
    pub num_classes: usize,
    pub labels: HashMap<usize, String>,
}

impl ModelConfig {
    /// Load a model config file. A relative `LabelsPath` resolves against the
    /// config file's directory.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw, path.parent())
    }

    pub fn from_json(raw: &str, base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let file: ModelConfigFile = serde_json::from_str(raw)?;
        let pre = file.pre_process.into_iter().next().unwrap_or_default();
        let post = file
            .post_process
            .into_iter()
            .next()
            .ok_or(ConfigError::Missing("POST_PROCESS[0]"))?;

        let strides = post.strides.ok_or(ConfigError::Missing("POST_PROCESS[0].Strides"))?;
        let labels = match (post.labels, post.labels_path) {
            (Some(inline), _) => parse_label_table(inline)?,
            (None, Some(path)) => {
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path,
                };
                load_label_table(&path)?
            }
            (None, None) => return Err(ConfigError::Missing("POST_PROCESS[0].LabelsPath")),
        };

        let cfg = Self {
            input_width: pre.input_w.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: pre.input_h.unwrap_or(DEFAULT_INPUT_SIZE),
            strides,
            reg_max: post.reg_max.unwrap_or(DEFAULT_REG_MAX),
            conf_threshold: post.output_conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
            nms_iou_threshold: post.output_nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            num_classes: post.output_num_classes.unwrap_or(DEFAULT_NUM_CLASSES),
            labels,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strides.is_empty() {
            return Err(ConfigError::Missing("POST_PROCESS[0].Strides"));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(ConfigError::Invalid("input size must be non-zero".into()));
        }
        for &stride in &self.strides {
            if stride == 0 || stride > self.input_width || stride > self.input_height {
                return Err(ConfigError::Invalid(format!(
                    "stride {} does not fit input {}x{}",
                    stride, self.input_width, self.input_height
                )));
            }
        }
        if self.num_classes == 0 {
            return Err(ConfigError::Invalid("OutputNumClasses must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(ConfigError::Invalid(
                "OutputConfThreshold must be within 0..=1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.nms_iou_threshold) {
            return Err(ConfigError::Invalid(
                "OutputNMSThreshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }

    /// Number of distance bins per box side.
    pub fn bins(&self) -> usize {
        self.reg_max + 1
    }

    pub fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

fn load_label_table(path: &Path) -> Result<HashMap<usize, String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: HashMap<String, String> = serde_json::from_str(&raw)?;
    parse_label_table(table)
}

fn parse_label_table(table: HashMap<String, String>) -> Result<HashMap<usize, String>, ConfigError> {
    table
        .into_iter()
        .map(|(key, label)| {
            key.trim()
                .parse::<usize>()
                .map(|id| (id, label))
                .map_err(|_| ConfigError::Invalid(format!("label key '{}' is not a class id", key)))
        })
        .collect()
}
