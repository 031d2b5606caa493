use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::DeliverySettings;
use crate::ingest::SourceConfig;
use crate::location::{Location, LocationSetting};
use crate::pipeline::{DedupThresholds, OrchestratorSettings};
use crate::recognize::RecognitionMode;

const DEFAULT_DB_PATH: &str = "db/lpr_data.db";
const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_CHECKPOINT_ID: &str = "checkpoint-0";
const DEFAULT_LOCATION: &str = "auto";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000/lpr";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_JPEG_MAX_SIDE: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 50;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    output_dir: Option<PathBuf>,
    hostname: Option<String>,
    checkpoint_id: Option<String>,
    location: Option<String>,
    source: Option<SourceConfig>,
    models: Option<ModelPaths>,
    recognition: Option<RecognitionConfigFile>,
    dedup: Option<DedupThresholds>,
    delivery: Option<DeliveryConfigFile>,
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    mode: Option<RecognitionMode>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    server_url: Option<String>,
    poll_interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
    jpeg_max_side: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfigFile {
    file: Option<PathBuf>,
}

/// Paths to the model JSON blobs. A model without a path is not loaded.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelPaths {
    pub vehicle: Option<PathBuf>,
    pub plate: Option<PathBuf>,
    pub ocr: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    pub server_url: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub backoff_max: Duration,
    pub jpeg_max_side: u32,
    pub jpeg_quality: u8,
}

/// Validated configuration, built once at startup and passed down by
/// reference.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub output_dir: PathBuf,
    pub hostname: String,
    pub checkpoint_id: String,
    pub location: LocationSetting,
    pub source: SourceConfig,
    pub models: ModelPaths,
    pub recognition_mode: RecognitionMode,
    pub dedup: DedupThresholds,
    pub delivery: DeliveryConfig,
    pub log_file: Option<PathBuf>,
}

impl PipelineConfig {
    /// File named by `LPR_CONFIG` (if any), then `LPR_*` overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LPR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let location = file
            .location
            .as_deref()
            .unwrap_or(DEFAULT_LOCATION)
            .parse::<LocationSetting>()?;
        let delivery = file.delivery.unwrap_or_default();
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            hostname: file.hostname.unwrap_or_else(system_hostname),
            checkpoint_id: file
                .checkpoint_id
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_ID.to_string()),
            location,
            source: file.source.unwrap_or_default(),
            models: file.models.unwrap_or_default(),
            recognition_mode: file
                .recognition
                .and_then(|recognition| recognition.mode)
                .unwrap_or_default(),
            dedup: file.dedup.unwrap_or_default(),
            delivery: DeliveryConfig {
                server_url: delivery
                    .server_url
                    .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
                poll_interval: Duration::from_secs(
                    delivery.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                ),
                timeout: Duration::from_secs(delivery.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
                backoff_max: Duration::from_secs(
                    delivery.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
                ),
                jpeg_max_side: delivery.jpeg_max_side.unwrap_or(DEFAULT_JPEG_MAX_SIDE),
                jpeg_quality: delivery.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            log_file: file.logging.and_then(|logging| logging.file),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("LPR_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_value("LPR_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(hostname) = env_value("LPR_HOSTNAME") {
            self.hostname = hostname;
        }
        if let Some(id) = env_value("LPR_CHECKPOINT_ID") {
            self.checkpoint_id = id;
        }
        if let Some(location) = env_value("LPR_LOCATION") {
            self.location = location
                .parse()
                .map_err(|e| anyhow!("LPR_LOCATION: {:#}", e))?;
        }
        if let Some(url) = env_value("LPR_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(path) = env_value("LPR_VEHICLE_MODEL") {
            self.models.vehicle = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("LPR_PLATE_MODEL") {
            self.models.plate = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("LPR_OCR_MODEL") {
            self.models.ocr = Some(PathBuf::from(path));
        }
        if let Some(mode) = env_value("LPR_RECOGNITION_MODE") {
            self.recognition_mode = mode.parse()?;
        }
        if let Some(value) = env_value("LPR_TEXT_THRESHOLD") {
            self.dedup.text_threshold = value
                .parse()
                .map_err(|_| anyhow!("LPR_TEXT_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_value("LPR_IMAGE_THRESHOLD") {
            self.dedup.image_threshold = value
                .parse()
                .map_err(|_| anyhow!("LPR_IMAGE_THRESHOLD must be a number"))?;
        }
        if let Some(url) = env_value("LPR_SERVER_URL") {
            self.delivery.server_url = url;
        }
        if let Some(value) = env_value("LPR_POLL_INTERVAL") {
            let seconds: u64 = value
                .parse()
                .map_err(|_| anyhow!("LPR_POLL_INTERVAL must be an integer number of seconds"))?;
            self.delivery.poll_interval = Duration::from_secs(seconds);
        }
        if let Some(path) = env_value("LPR_LOG_FILE") {
            self.log_file = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (name, value) in [
            ("dedup.text_threshold", self.dedup.text_threshold),
            ("dedup.image_threshold", self.dedup.image_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("{} must be within (0, 1], got {}", name, value));
            }
        }
        if self.delivery.poll_interval.is_zero() {
            return Err(anyhow!("delivery.poll_interval_secs must be greater than zero"));
        }
        if self.delivery.timeout.is_zero() {
            return Err(anyhow!("delivery.timeout_secs must be greater than zero"));
        }
        if self.delivery.backoff_max < self.delivery.poll_interval {
            self.delivery.backoff_max = self.delivery.poll_interval;
        }
        if !(1..=100).contains(&self.delivery.jpeg_quality) {
            return Err(anyhow!("delivery.jpeg_quality must be within 1..=100"));
        }
        if self.delivery.jpeg_max_side == 0 {
            return Err(anyhow!("delivery.jpeg_max_side must be greater than zero"));
        }
        let url = url::Url::parse(&self.delivery.server_url)
            .map_err(|e| anyhow!("delivery.server_url '{}': {}", self.delivery.server_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("delivery.server_url must use http or https"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("hostname must not be empty"));
        }
        if self.checkpoint_id.trim().is_empty() {
            return Err(anyhow!("checkpoint_id must not be empty"));
        }
        if self.recognition_mode == RecognitionMode::OcrModel && self.models.ocr.is_none() {
            return Err(anyhow!("recognition mode ocr_model needs models.ocr"));
        }
        Ok(())
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            checkpoint_id: self.checkpoint_id.clone(),
            poll_interval: self.delivery.poll_interval,
            backoff_max: self.delivery.backoff_max,
            jpeg_max_side: self.delivery.jpeg_max_side,
            jpeg_quality: self.delivery.jpeg_quality,
        }
    }

    pub fn orchestrator_settings(&self, location: Location) -> OrchestratorSettings {
        OrchestratorSettings {
            hostname: self.hostname.clone(),
            location,
            output_dir: self.output_dir.clone(),
            thresholds: self.dedup,
            retry_delay: Duration::from_millis(self.source.retry_delay_ms),
            frame_interval: Duration::from_millis(self.source.frame_interval_ms),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn system_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// JSON by default; `.toml` files are parsed as TOML.
fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
