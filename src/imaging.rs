//! Image helpers shared by the detection stages, the deduplicator and the
//! delivery worker.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, Rgb, RgbImage};

use crate::detect::BBox;

/// Side length both images are resized to before histogram comparison.
pub const HISTOGRAM_SIDE: u32 = 128;

/// An image fitted into a model input, plus what is needed to map back.
#[derive(Clone, Debug)]
pub struct Letterbox {
    pub image: RgbImage,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a box from letterboxed coordinates into the source image and clip it.
    pub fn to_source(&self, bbox: &BBox, src_width: u32, src_height: u32) -> BBox {
        BBox::new(
            (bbox.x_min - self.pad_x) / self.scale,
            (bbox.y_min - self.pad_y) / self.scale,
            (bbox.x_max - self.pad_x) / self.scale,
            (bbox.y_max - self.pad_y) / self.scale,
        )
        .clip(src_width as f32, src_height as f32)
    }
}

/// Aspect-preserving resize into `width x height`, centered on black padding.
pub fn letterbox(src: &RgbImage, width: u32, height: u32) -> Letterbox {
    let (src_w, src_h) = src.dimensions();
    if (src_w, src_h) == (width, height) {
        return Letterbox {
            image: src.clone(),
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
    }

    let scale = (width as f32 / src_w.max(1) as f32).min(height as f32 / src_h.max(1) as f32);
    let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, width);
    let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, height);
    let resized = imageops::resize(src, new_w, new_h, FilterType::Triangle);

    let pad_x = (width - new_w) / 2;
    let pad_y = (height - new_h) / 2;
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    Letterbox {
        image: canvas,
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    }
}

/// Crop a box out of an image. `None` when the box is empty after integer
/// conversion.
pub fn crop(image: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    let x0 = bbox.x_min.max(0.0) as u32;
    let y0 = bbox.y_min.max(0.0) as u32;
    let x1 = (bbox.x_max.max(0.0) as u32).min(w);
    let y1 = (bbox.y_max.max(0.0) as u32).min(h);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some(imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

fn gray_histogram(image: &RgbImage) -> [f64; 256] {
    let resized = imageops::resize(image, HISTOGRAM_SIDE, HISTOGRAM_SIDE, FilterType::Triangle);
    let gray: GrayImage = imageops::grayscale(&resized);
    let mut hist = [0f64; 256];
    for pixel in gray.pixels() {
        hist[pixel.0[0] as usize] += 1.0;
    }
    hist
}

/// Correlation of the 256-bin grayscale histograms of two images, clamped to
/// `[0, 1]`.
pub fn histogram_correlation(a: &RgbImage, b: &RgbImage) -> f32 {
    let ha = gray_histogram(a);
    let hb = gray_histogram(b);
    let mean_a = ha.iter().sum::<f64>() / 256.0;
    let mean_b = hb.iter().sum::<f64>() / 256.0;

    let mut num = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in ha.iter().zip(hb.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        num += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    let correl = if denom > f64::EPSILON { num / denom } else { 1.0 };
    (correl as f32).clamp(0.0, 1.0)
}

/// Shrink so the longer side is at most `max_side`, then JPEG-encode.
pub fn encode_jpeg(image: &RgbImage, max_side: u32, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    let scaled;
    let to_encode = if longest > max_side && max_side > 0 {
        let ratio = max_side as f32 / longest as f32;
        let nw = ((w as f32 * ratio).round() as u32).max(1);
        let nh = ((h as f32 * ratio).round() as u32).max(1);
        scaled = imageops::thumbnail(image, nw, nh);
        &scaled
    } else {
        image
    };

    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(to_encode)
        .context("jpeg encode failed")?;
    Ok(buf.into_inner())
}

pub fn encode_jpeg_base64(image: &RgbImage, max_side: u32, quality: u8) -> Result<String> {
    let bytes = encode_jpeg(image, max_side, quality)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).with_context(|| format!("failed to open image {}", path.display()))?;
    Ok(img.to_rgb8())
}

pub fn save_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, 40]))
    }

    #[test]
    fn letterbox_pads_the_short_side() {
        let src = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let lb = letterbox(&src, 100, 100);
        assert_eq!(lb.image.dimensions(), (100, 100));
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 25.0);
        assert_eq!(lb.image.get_pixel(50, 0), &Rgb([0, 0, 0]));
        assert_eq!(lb.image.get_pixel(50, 50), &Rgb([255, 255, 255]));
    }

    #[test]
    fn letterbox_maps_boxes_back() {
        let src = RgbImage::new(200, 100);
        let lb = letterbox(&src, 100, 100);
        let mapped = lb.to_source(&BBox::new(10.0, 25.0, 60.0, 75.0), 200, 100);
        assert_eq!(mapped, BBox::new(20.0, 0.0, 120.0, 100.0));
    }

    #[test]
    fn crop_rejects_empty_boxes() {
        let img = gradient(50, 50);
        assert!(crop(&img, &BBox::new(10.2, 10.0, 10.9, 20.0)).is_none());
        assert!(crop(&img, &BBox::new(60.0, 0.0, 70.0, 10.0)).is_none());
        let c = crop(&img, &BBox::new(5.0, 5.0, 25.0, 15.0)).unwrap();
        assert_eq!(c.dimensions(), (20, 10));
    }

    #[test]
    fn identical_images_correlate_fully() {
        let img = gradient(64, 48);
        assert!((histogram_correlation(&img, &img) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dark_and_bright_images_do_not_correlate() {
        let dark = RgbImage::from_fn(64, 64, |x, _| Rgb([(x % 16) as u8, 0, 0]));
        let bright = RgbImage::from_fn(64, 64, |x, _| Rgb([255, 255, 240 + (x % 16) as u8]));
        assert!(histogram_correlation(&dark, &bright) < 0.1);
    }

    #[test]
    fn jpeg_is_bounded_and_decodable() {
        let img = gradient(1280, 720);
        let bytes = encode_jpeg(&img, 640, 50).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
        assert!(!encode_jpeg_base64(&img, 640, 50).unwrap().is_empty());
    }
}
