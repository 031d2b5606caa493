use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::FrameSource;
use crate::frame::Frame;

/// Polls a camera's JPEG snapshot endpoint, one request per frame.
pub struct HttpSnapshotSource {
    url: String,
    agent: ureq::Agent,
    frame_count: u64,
    last_error: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("invalid snapshot url {}", url))?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            frame_count: 0,
            last_error: None,
        })
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for HttpSnapshotSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let decoded = self
            .fetch()
            .and_then(|bytes| image::load_from_memory(&bytes).context("decode jpeg"));
        match decoded {
            Ok(image) => {
                self.frame_count += 1;
                self.last_error = None;
                Ok(Some(Frame::new(self.frame_count, image.to_rgb8())))
            }
            Err(err) => {
                self.last_error = Some(format!("{:#}", err));
                Err(err)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }
}
