use std::cmp::Ordering;

use super::result::BBox;

/// Greedy non-max suppression over one class.
///
/// Candidates are stable-sorted by descending score, so equal scores keep their
/// input order. A candidate survives when its IoU with every already kept box
/// is at most `iou_threshold`.
pub fn non_max_suppression(mut candidates: Vec<(BBox, f32)>, iou_threshold: f32) -> Vec<(BBox, f32)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut kept: Vec<(BBox, f32)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|(kept_box, _)| kept_box.iou(&candidate.0) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
