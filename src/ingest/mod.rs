//! Frame ingestion sources.
//!
//! A source is chosen by the scheme of `source.url`:
//! - `stub://<name>`: synthetic frames (testing, bring-up)
//! - `dir://<path>`: still images from a local directory, in name order
//! - `http://` / `https://`: JPEG snapshot endpoint polled once per frame
//!
//! Sources hand out one frame per call and never buffer ahead; a busy
//! orchestrator simply does not ask for the next frame.

pub mod directory;
pub mod http;
pub mod synthetic;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub use directory::DirectorySource;
pub use http::HttpSnapshotSource;
pub use synthetic::SyntheticSource;

/// Configuration for the frame source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
    /// Frame size of synthetic sources.
    pub width: u32,
    pub height: u32,
    /// Wait after a failed acquisition before the next cycle.
    pub retry_delay_ms: u64,
    /// Wait between completed frames.
    pub frame_interval_ms: u64,
    /// Request timeout of network sources.
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 640,
            height: 640,
            retry_delay_ms: 100,
            frame_interval_ms: 50,
            timeout_secs: 5,
        }
    }
}

/// A producer of frames.
///
/// `Ok(None)` means no frame is available right now; the caller treats it
/// like a failed acquisition and tries again after a delay.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Open the source named by `config.url`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let url = config.url.trim();
    if url.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::new(config.clone())))
    } else if let Some(path) = url.strip_prefix("dir://") {
        Ok(Box::new(DirectorySource::open(path)?))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Box::new(HttpSnapshotSource::new(url, config.timeout_secs)?))
    } else {
        Err(anyhow!(
            "unsupported source url '{}' (expected stub://, dir:// or http(s)://)",
            url
        ))
    }
}
