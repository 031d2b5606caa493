use std::path::{Path, PathBuf};

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::BBox;
use crate::imaging::save_jpeg;

const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);

/// Paths of the images written for one accepted plate.
#[derive(Clone, Debug, PartialEq)]
pub struct EvidencePaths {
    pub vehicle: String,
    pub plate: String,
    pub cropped: String,
}

/// Writes the evidence images of accepted plates under one directory.
#[derive(Clone, Debug)]
pub struct EvidenceWriter {
    output_dir: PathBuf,
}

impl EvidenceWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the full frame, the vehicle crop with the plate outlined, and the
    /// plate crop. `plate_box` is in vehicle-crop coordinates.
    ///
    /// Names are `<timestamp>_f<frame_id>_<kind>.jpg`; the frame id keeps
    /// plates accepted within the same second apart.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        timestamp: &str,
        frame_id: u64,
        index: usize,
        frame: &RgbImage,
        vehicle: &RgbImage,
        plate_box: &BBox,
        plate: &RgbImage,
    ) -> Result<EvidencePaths> {
        let vehicle_path = self.path_for(timestamp, frame_id, "vehicle_full_frame");
        save_jpeg(frame, &vehicle_path)?;

        let mut annotated = vehicle.clone();
        let width = plate_box.width().round().max(1.0) as u32;
        let height = plate_box.height().round().max(1.0) as u32;
        draw_hollow_rect_mut(
            &mut annotated,
            Rect::at(plate_box.x_min as i32, plate_box.y_min as i32).of_size(width, height),
            OUTLINE,
        );
        let plate_path = self.path_for(timestamp, frame_id, "license_plate_detected");
        save_jpeg(&annotated, &plate_path)?;

        let cropped_path = self.path_for(timestamp, frame_id, &format!("cropped_plate_{}", index));
        save_jpeg(plate, &cropped_path)?;

        Ok(EvidencePaths {
            vehicle: vehicle_path.to_string_lossy().into_owned(),
            plate: plate_path.to_string_lossy().into_owned(),
            cropped: cropped_path.to_string_lossy().into_owned(),
        })
    }

    fn path_for(&self, timestamp: &str, frame_id: u64, kind: &str) -> PathBuf {
        self.output_dir.join(format!("{}_f{}_{}.jpg", timestamp, frame_id, kind))
    }
}
