use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use super::FrameSource;
use crate::frame::Frame;
use crate::imaging;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Replays still images from a local directory, sorted by file name.
///
/// Each file is yielded once. An unreadable file is an acquisition error for
/// that cycle only; the next call moves on to the next file.
pub struct DirectorySource {
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    frame_count: u64,
}

impl DirectorySource {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&root)
            .with_context(|| format!("failed to list {}", root.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                files.push(path);
            }
        }
        files.sort();
        log::info!("DirectorySource: {} images under {}", files.len(), root.display());
        Ok(Self {
            root,
            pending: files.into(),
            frame_count: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for DirectorySource {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.frame_count += 1;
        let image = imaging::load_rgb(&path)
            .map_err(|err| anyhow!("frame {} unreadable: {:#}", self.frame_count, err))?;
        Ok(Some(Frame::new(self.frame_count, image)))
    }

    fn is_healthy(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn yields_images_in_name_order_then_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::new(8, 4).save(dir.path().join("b.png"))?;
        RgbImage::new(4, 8).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("notes.txt"), "skip me")?;

        let mut source = DirectorySource::open(dir.path())?;
        assert_eq!(source.remaining(), 2);
        let first = source.next_frame()?.unwrap();
        assert_eq!(first.width(), 4);
        let second = source.next_frame()?.unwrap();
        assert_eq!(second.width(), 8);
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_an_error_for_one_cycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.jpg"), b"not a jpeg")?;
        RgbImage::new(3, 3).save(dir.path().join("b.png"))?;

        let mut source = DirectorySource::open(dir.path())?;
        assert!(source.next_frame().is_err());
        assert!(source.next_frame()?.is_some());
        Ok(())
    }
}
