use std::sync::OnceLock;

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::box_filter;
use regex::Regex;

/// Neighbourhood radius of the adaptive threshold.
const THRESHOLD_RADIUS: u32 = 5;
/// Offset subtracted from the local mean.
const THRESHOLD_OFFSET: i16 = 2;

/// Grayscale, equalize, then adaptive mean threshold.
pub fn preprocess_for_ocr(crop: &RgbImage) -> RgbImage {
    let gray = DynamicImage::ImageRgb8(crop.clone()).to_luma8();
    let equalized = equalize_histogram(&gray);
    let local_mean = box_filter(&equalized, THRESHOLD_RADIUS, THRESHOLD_RADIUS);

    let binary = GrayImage::from_fn(equalized.width(), equalized.height(), |x, y| {
        let value = equalized.get_pixel(x, y).0[0] as i16;
        let mean = local_mean.get_pixel(x, y).0[0] as i16;
        if value > mean - THRESHOLD_OFFSET {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    DynamicImage::ImageLuma8(binary).to_rgb8()
}

/// Drop whitespace and punctuation, uppercase ASCII letters.
///
/// Letters of any script are kept with their combining marks, so Thai
/// characters and province names survive.
pub fn normalize_text(raw: &str) -> String {
    static NON_PLATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = NON_PLATE_RE.get_or_init(|| Regex::new(r"[^\p{L}\p{M}\p{N}]").unwrap());
    re.replace_all(raw, "").to_ascii_uppercase()
}
