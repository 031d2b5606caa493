use anyhow::Result;
use image::{Rgb, RgbImage};

use super::{FrameSource, SourceConfig};
use crate::frame::Frame;

/// Synthetic source (`stub://`) for tests and bring-up without a camera.
///
/// Produces a moving gradient; the scene shifts every 50 frames.
pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        log::info!("SyntheticSource: {} ({}x{})", config.url, config.width, config.height);
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate(&mut self) -> RgbImage {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shift = self.frame_count + self.scene_state as u64;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            let v = ((x as u64 + y as u64 + shift) % 256) as u8;
            Rgb([v, v.wrapping_add(self.scene_state), 128])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.frame_count += 1;
        let image = self.generate();
        Ok(Some(Frame::new(self.frame_count, image)))
    }
}
