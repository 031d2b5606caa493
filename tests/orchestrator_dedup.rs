use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use lpr_edge::{
    Accelerator, BBox, DedupThresholds, Detection, DetectionStage, Frame, FrameOutcome,
    FrameSource, InMemoryOutbox, Location, ModelConfig, Orchestrator, OrchestratorSettings,
    OrchestratorStages, Outbox, PlateReader, Recognition, RecognitionMode, RecordFilter,
    StageError, StubBackend, TextRecognizer,
};

const FRAME_SIDE: u32 = 320;
const VEHICLE: [f32; 4] = [40.0, 40.0, 280.0, 280.0];
const PLATE: [f32; 4] = [60.0, 150.0, 180.0, 190.0];

/// Returns scripted texts in order, then empty text. Counts calls.
struct ScriptedReader {
    texts: VecDeque<Result<String, String>>,
    calls: Arc<AtomicUsize>,
}

impl TextRecognizer for ScriptedReader {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn recognize(&mut self, _image: &RgbImage) -> Result<Recognition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.texts.pop_front() {
            Some(Ok(text)) => Ok(Recognition {
                text,
                confidence: Some(0.9),
            }),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Recognition::empty()),
        }
    }
}

struct ScriptedSource {
    frames: VecDeque<Result<Option<Frame>>>,
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".into()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.frames.pop_front().unwrap_or(Ok(None))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

fn detection(b: [f32; 4], label: &str) -> Detection {
    Detection {
        bbox: BBox::new(b[0], b[1], b[2], b[3]),
        score: 0.9,
        class_id: 0,
        label: label.to_string(),
    }
}

fn model(width: u32, height: u32, label: &str) -> ModelConfig {
    ModelConfig {
        input_width: width,
        input_height: height,
        strides: vec![8, 16, 32],
        reg_max: 16,
        conf_threshold: 0.3,
        nms_iou_threshold: 0.6,
        num_classes: 1,
        labels: HashMap::from([(0, label.to_string())]),
    }
}

/// Model inputs match the frame and the vehicle crop, so boxes pass through
/// the letterbox unchanged.
fn build(
    vehicles: StubBackend,
    plates: StubBackend,
    texts: Vec<Result<&str, &str>>,
    thresholds: DedupThresholds,
    output_dir: &Path,
) -> (Orchestrator<InMemoryOutbox>, Arc<AtomicUsize>) {
    let accel = Arc::new(Accelerator::new());
    accel.register("vehicle", vehicles).unwrap();
    accel.register("plate", plates).unwrap();
    let vehicle_side = (VEHICLE[2] - VEHICLE[0]) as u32;

    let calls = Arc::new(AtomicUsize::new(0));
    let reader = ScriptedReader {
        texts: texts
            .into_iter()
            .map(|t| t.map(str::to_string).map_err(str::to_string))
            .collect(),
        calls: calls.clone(),
    };
    let stages = OrchestratorStages {
        vehicle: DetectionStage::new(
            "vehicle",
            accel.clone(),
            model(FRAME_SIDE, FRAME_SIDE, "vehicle"),
        )
        .unwrap(),
        plate: DetectionStage::new(
            "plate",
            accel,
            model(vehicle_side, vehicle_side, "license_plate"),
        )
        .unwrap(),
        reader: PlateReader::new(RecognitionMode::RawFrame, Box::new(reader)),
    };
    let settings = OrchestratorSettings {
        hostname: "gate-1".into(),
        location: Location::new(13.75, 100.5),
        output_dir: output_dir.to_path_buf(),
        thresholds,
        retry_delay: Duration::ZERO,
        frame_interval: Duration::ZERO,
    };
    (
        Orchestrator::new(stages, InMemoryOutbox::new(), settings),
        calls,
    )
}

fn one_vehicle_one_plate() -> (StubBackend, StubBackend) {
    (
        StubBackend::with_detections(vec![detection(VEHICLE, "vehicle")]),
        StubBackend::with_detections(vec![detection(PLATE, "license_plate")]),
    )
}

fn solid_frame(id: u64, gray: u8) -> Frame {
    Frame::new(id, RgbImage::from_pixel(FRAME_SIDE, FRAME_SIDE, Rgb([gray, gray, gray])))
}

fn done(outcome: FrameOutcome) -> lpr_edge::FrameSummary {
    match outcome {
        FrameOutcome::Done(summary) => summary,
        FrameOutcome::Skipped(err) => panic!("frame skipped: {}", err),
    }
}

#[test]
fn near_duplicate_plate_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Ok("ABC123"), Ok("ABC124")],
        DedupThresholds::default(),
        dir.path(),
    );

    let first = done(orch.process_frame(solid_frame(1, 60)));
    let id = first.accepted.expect("first plate accepted");
    assert_eq!(orch.dedup_state().last_text(), Some("ABC123"));

    // Text similarity is 10/12 (below 0.85); the identical crop decides.
    let second = done(orch.process_frame(solid_frame(2, 60)));
    assert_eq!(second.accepted, None);
    assert_eq!(second.rejected, 1);
    assert_eq!(orch.dedup_state().last_text(), Some("ABC123"));

    let outbox = orch.outbox_mut();
    assert_eq!(outbox.len(), 1);
    let record = outbox.get(id).unwrap().unwrap();
    assert_eq!(record.record.license_text, "ABC123");
    assert_eq!(record.record.hostname, "gate-1");
    assert_eq!(record.record.location, Location::new(13.75, 100.5));
    assert!(Path::new(&record.record.vehicle_image_ref).exists());
    assert!(Path::new(&record.record.plate_image_ref).exists());
    assert!(record.record.cropped_image_ref.ends_with("_cropped_plate_0.jpg"));
    assert!(Path::new(&record.record.cropped_image_ref).exists());
}

#[test]
fn identical_candidates_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Ok("XYZ789"), Ok("XYZ789")],
        DedupThresholds::default(),
        dir.path(),
    );
    assert!(done(orch.process_frame(solid_frame(1, 90))).accepted.is_some());
    let second = done(orch.process_frame(solid_frame(2, 90)));
    assert_eq!(second.accepted, None);
    assert_eq!(orch.stats().accepted, 1);
    assert_eq!(orch.stats().rejected, 1);
}

#[test]
fn distinct_plates_are_accepted_under_loose_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Ok("ABC123"), Ok("XYZ789")],
        DedupThresholds {
            text_threshold: 0.5,
            image_threshold: 0.5,
        },
        dir.path(),
    );
    assert!(done(orch.process_frame(solid_frame(1, 40))).accepted.is_some());
    // Different text and a crop with a disjoint histogram.
    assert!(done(orch.process_frame(solid_frame(2, 210))).accepted.is_some());
    assert_eq!(orch.dedup_state().last_text(), Some("XYZ789"));

    let records = orch.outbox_mut().search(&RecordFilter::default()).unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn first_accepted_plate_ends_the_frame() {
    let dir = tempfile::tempdir().unwrap();
    let second_vehicle = [10.0, 10.0, 250.0, 250.0];
    let (mut orch, calls) = build(
        StubBackend::with_detections(vec![
            detection(VEHICLE, "vehicle"),
            detection(second_vehicle, "vehicle"),
        ]),
        StubBackend::with_detections(vec![detection(PLATE, "license_plate")]),
        vec![Ok("ABC123"), Ok("QRS456")],
        DedupThresholds::default(),
        dir.path(),
    );

    let summary = done(orch.process_frame(solid_frame(1, 60)));
    assert_eq!(summary.vehicles, 2);
    assert_eq!(summary.plates, 1);
    assert!(summary.accepted.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.outbox_mut().len(), 1);
}

#[test]
fn frame_without_vehicles_is_done_and_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (mut orch, calls) = build(
        StubBackend::new(),
        StubBackend::with_detections(vec![detection(PLATE, "license_plate")]),
        vec![Ok("ABC123")],
        DedupThresholds::default(),
        dir.path(),
    );
    let summary = done(orch.process_frame(solid_frame(7, 60)));
    assert_eq!(summary.frame_id, 7);
    assert_eq!(summary.vehicles, 0);
    assert_eq!(summary.accepted, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(orch.dedup_state().is_empty());
    assert!(orch.outbox_mut().is_empty());
}

#[test]
fn acquisition_failures_skip_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Ok("ABC123")],
        DedupThresholds::default(),
        dir.path(),
    );
    let mut source = ScriptedSource {
        frames: VecDeque::from(vec![
            Err(anyhow!("camera unplugged")),
            Ok(None),
            Ok(Some(solid_frame(3, 60))),
        ]),
    };

    for _ in 0..2 {
        assert!(matches!(
            orch.run_once(&mut source),
            FrameOutcome::Skipped(StageError::Acquisition(_))
        ));
    }
    assert!(done(orch.run_once(&mut source)).accepted.is_some());
    assert_eq!(orch.stats().frames_skipped, 2);
    assert_eq!(orch.stats().frames_processed, 1);
}

#[test]
fn empty_frame_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(vehicles, plates, vec![], DedupThresholds::default(), dir.path());
    assert!(matches!(
        orch.process_frame(Frame::new(1, RgbImage::new(0, 0))),
        FrameOutcome::Skipped(StageError::Acquisition(_))
    ));
}

#[test]
fn stage_failures_are_contained_to_the_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (mut orch, calls) = build(
        StubBackend::failing("accelerator reset")
            .then(Ok(lpr_edge::InferenceOutput::Detections(Vec::new())))
            .then(Err("accelerator reset".into())),
        StubBackend::with_detections(vec![detection(PLATE, "license_plate")]),
        vec![Ok("ABC123")],
        DedupThresholds::default(),
        dir.path(),
    );

    // Queued: no vehicles, then an error; the fallback keeps failing.
    assert_eq!(done(orch.process_frame(solid_frame(1, 60))).errors, 0);
    for id in 2..4 {
        let summary = done(orch.process_frame(solid_frame(id, 60)));
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.accepted, None);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(orch.stats().frames_processed, 3);
    assert_eq!(orch.stats().stage_errors, 2);
}

#[test]
fn plate_stage_failure_moves_to_the_next_vehicle() {
    let dir = tempfile::tempdir().unwrap();
    let (mut orch, calls) = build(
        StubBackend::with_detections(vec![
            detection(VEHICLE, "vehicle"),
            detection(VEHICLE, "vehicle"),
        ]),
        StubBackend::with_detections(vec![detection(PLATE, "license_plate")])
            .then(Err("plate model timeout".into())),
        vec![Ok("ABC123")],
        DedupThresholds::default(),
        dir.path(),
    );
    let summary = done(orch.process_frame(solid_frame(1, 60)));
    assert_eq!(summary.errors, 1);
    assert!(summary.accepted.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unreadable_plate_is_recorded_with_empty_text() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Err("ocr engine crashed")],
        DedupThresholds::default(),
        dir.path(),
    );
    let summary = done(orch.process_frame(solid_frame(1, 60)));
    let id = summary.accepted.expect("empty-text plate still persisted");
    let record = orch.outbox_mut().get(id).unwrap().unwrap();
    assert_eq!(record.record.license_text, "");
}

#[test]
fn thai_plate_text_is_stored_intact() {
    let dir = tempfile::tempdir().unwrap();
    let (vehicles, plates) = one_vehicle_one_plate();
    let (mut orch, _) = build(
        vehicles,
        plates,
        vec![Ok(" 1กก-234 กรุงเทพมหานคร "), Ok("1กก 235 กรุงเทพมหานคร")],
        DedupThresholds::default(),
        dir.path(),
    );
    let id = done(orch.process_frame(solid_frame(1, 60)))
        .accepted
        .expect("first plate accepted");
    assert_eq!(orch.dedup_state().last_text(), Some("1กก234กรุงเทพมหานคร"));
    let record = orch.outbox_mut().get(id).unwrap().unwrap();
    assert_eq!(record.record.license_text, "1กก234กรุงเทพมหานคร");

    // The Thai letters count toward text similarity, not only the digits.
    let second = done(orch.process_frame(solid_frame(2, 200)));
    assert_eq!(second.accepted, None);
    assert_eq!(second.rejected, 1);
}
