use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lpr_edge::{BBox, DecodeError, ModelConfig, Postprocessor, Quantization, RawTensor};

const GRID: usize = 20;
const STRIDE: u32 = 32;
const REG_MAX: usize = 7;
const BINS: usize = REG_MAX + 1;

fn single_level_config() -> ModelConfig {
    ModelConfig {
        input_width: 640,
        input_height: 640,
        strides: vec![STRIDE],
        reg_max: REG_MAX,
        conf_threshold: 0.5,
        nms_iou_threshold: 0.5,
        num_classes: 1,
        labels: HashMap::from([(0, "license_plate".to_string())]),
    }
}

/// u8 heads for a 20x20 grid: class scores are `raw / 255`, regression logits
/// are raw values. `peaks` lists `(col, row, class_raw, bin)`; a peaked cell
/// puts all four sides on `bin`.
fn quantized_heads(peaks: &[(usize, usize, u8, usize)]) -> Vec<RawTensor> {
    let cells = GRID * GRID;
    let mut cls = vec![0u8; cells];
    let mut reg = vec![0u8; cells * 4 * BINS];
    for &(col, row, score, bin) in peaks {
        let cell = row * GRID + col;
        cls[cell] = score;
        for side in 0..4 {
            reg[cell * 4 * BINS + side * BINS + bin] = 255;
        }
    }
    vec![
        RawTensor::u8(vec![1, GRID, GRID, 4 * BINS], reg, Quantization::new(1.0, 0.0)),
        RawTensor::u8(vec![1, GRID, GRID, 1], cls, Quantization::new(1.0 / 255.0, 0.0)),
    ]
}

fn assert_box(actual: &BBox, expected: [f32; 4]) {
    let got = [actual.x_min, actual.y_min, actual.x_max, actual.y_max];
    for (g, e) in got.iter().zip(expected.iter()) {
        assert!((g - e).abs() < 1e-2, "box {:?} != {:?}", got, expected);
    }
}

#[test]
fn decodes_quantized_single_level_heads() {
    let post = Postprocessor::new(single_level_config()).unwrap();
    let dets = post
        .decode(&quantized_heads(&[(10, 10, 230, 2), (0, 0, 200, 2)]))
        .unwrap();

    assert_eq!(dets.len(), 2);
    // Score-descending within the class.
    assert_eq!(dets[0].label, "license_plate");
    assert!((dets[0].score - 230.0 / 255.0).abs() < 1e-4);
    // Two bins of 32 px on every side of the (320, 320) prior.
    assert_box(&dets[0].bbox, [256.0, 256.0, 384.0, 384.0]);
    // The corner prior's box is clipped at the image origin.
    assert!((dets[1].score - 200.0 / 255.0).abs() < 1e-4);
    assert_box(&dets[1].bbox, [0.0, 0.0, 64.0, 64.0]);
}

#[test]
fn overlapping_neighbours_are_suppressed() {
    let post = Postprocessor::new(single_level_config()).unwrap();
    // Adjacent cells produce boxes with IoU 0.6, above the 0.5 threshold.
    let dets = post
        .decode(&quantized_heads(&[(5, 5, 240, 2), (6, 5, 220, 2)]))
        .unwrap();
    assert_eq!(dets.len(), 1);
    assert_box(&dets[0].bbox, [96.0, 96.0, 224.0, 224.0]);
}

#[test]
fn scores_at_the_threshold_are_dropped() {
    let mut cfg = single_level_config();
    cfg.conf_threshold = 0.0;
    let post = Postprocessor::new(cfg).unwrap();
    // Every cell scores exactly 0.0 except one.
    let dets = post.decode(&quantized_heads(&[(3, 4, 1, 1)])).unwrap();
    assert_eq!(dets.len(), 1);
}

#[test]
fn missing_labels_fall_back_to_class_ids() {
    let mut cfg = single_level_config();
    cfg.labels.clear();
    let post = Postprocessor::new(cfg).unwrap();
    let dets = post.decode(&quantized_heads(&[(10, 10, 230, 2)])).unwrap();
    assert_eq!(dets[0].label, "class_0");
}

#[test]
fn trailing_no_object_channel_is_ignored() {
    let post = Postprocessor::new(single_level_config()).unwrap();
    let cells = GRID * GRID;
    let mut cls = vec![0.0f32; cells * 2];
    cls[(2 * GRID + 2) * 2] = 0.9;
    // The extra column never counts as a class score.
    for cell in 0..cells {
        cls[cell * 2 + 1] = 1.0;
    }
    let reg = RawTensor::f32(vec![cells, 4 * BINS], vec![0.0; cells * 4 * BINS]);
    let dets = post
        .decode(&[RawTensor::f32(vec![cells, 2], cls), reg])
        .unwrap();
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class_id, 0);
}

#[test]
fn mismatched_heads_fail_without_partial_output() {
    let post = Postprocessor::new(single_level_config()).unwrap();
    let mut heads = quantized_heads(&[(10, 10, 230, 2)]);
    heads[0].shape = vec![1, GRID, GRID - 1, 4 * BINS];
    assert!(matches!(
        post.decode(&heads),
        Err(DecodeError::ShapeMismatch { .. })
    ));

    let heads = quantized_heads(&[(10, 10, 230, 2)]);
    let duplicated = vec![heads[0].clone(), heads[0].clone(), heads[1].clone()];
    assert!(matches!(
        post.decode(&duplicated),
        Err(DecodeError::DuplicateHead { stride: 32, .. })
    ));
}

#[test]
fn random_heads_decode_into_bounded_non_overlapping_boxes() {
    let cfg = ModelConfig {
        input_width: 320,
        input_height: 256,
        strides: vec![8, 16, 32],
        reg_max: 15,
        conf_threshold: 0.6,
        nms_iou_threshold: 0.45,
        num_classes: 3,
        labels: HashMap::new(),
    };
    let post = Postprocessor::new(cfg.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..5 {
        let mut heads = Vec::new();
        for &stride in &cfg.strides {
            let cells = ((cfg.input_width / stride) * (cfg.input_height / stride)) as usize;
            let cls: Vec<f32> = (0..cells * cfg.num_classes).map(|_| rng.gen()).collect();
            let reg: Vec<f32> = (0..cells * 4 * cfg.bins())
                .map(|_| rng.gen_range(-4.0..4.0))
                .collect();
            heads.push(RawTensor::f32(vec![1, cells, cfg.num_classes], cls));
            heads.push(RawTensor::f32(vec![1, cells, 4 * cfg.bins()], reg));
        }

        let dets = post.decode(&heads).unwrap();
        assert!(!dets.is_empty());
        for det in &dets {
            assert!(det.score > cfg.conf_threshold && det.score <= 1.0);
            assert!(det.bbox.is_valid());
            assert!(det.bbox.x_min >= 0.0 && det.bbox.y_min >= 0.0);
            assert!(det.bbox.x_max <= 320.0 && det.bbox.y_max <= 256.0);
            assert_eq!(det.label, format!("class_{}", det.class_id));
        }
        for (i, a) in dets.iter().enumerate() {
            for b in dets.iter().skip(i + 1).filter(|b| b.class_id == a.class_id) {
                assert!(a.bbox.iou(&b.bbox) <= cfg.nms_iou_threshold);
            }
        }
    }
}
