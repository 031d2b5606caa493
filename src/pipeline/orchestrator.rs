use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::detect::{BBox, DetectionStage};
use crate::error::StageError;
use crate::frame::Frame;
use crate::imaging;
use crate::ingest::FrameSource;
use crate::location::Location;
use crate::recognize::{PlateReader, Recognition};
use crate::storage::{CandidateRecord, Outbox};

use super::dedup::{DedupState, DedupThresholds, Deduplicator, Verdict};
use super::evidence::EvidenceWriter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// The three capabilities a frame passes through.
pub struct OrchestratorStages {
    pub vehicle: DetectionStage,
    pub plate: DetectionStage,
    pub reader: PlateReader,
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub hostname: String,
    pub location: Location,
    pub output_dir: std::path::PathBuf,
    pub thresholds: DedupThresholds,
    /// Wait after a skipped cycle.
    pub retry_delay: Duration,
    /// Wait after a completed frame.
    pub frame_interval: Duration,
}

/// What happened to one frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// No usable frame; the cycle restarts after `retry_delay`.
    Skipped(StageError),
    Done(FrameSummary),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameSummary {
    pub frame_id: u64,
    pub vehicles: usize,
    pub plates: usize,
    pub rejected: usize,
    /// Outbox id of the plate persisted for this frame, if any.
    pub accepted: Option<i64>,
    /// Stage failures caught while processing this frame.
    pub errors: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stage_errors: u64,
}

enum FrameState {
    AcquireFrame,
    DetectVehicles(Frame),
    ProcessVehicles { frame: Frame, vehicles: Vec<BBox> },
    Done(FrameSummary),
    Skipped(StageError),
}

enum PlateOutcome {
    Accepted(i64),
    Rejected,
    Failed(StageError),
}

/// Per-frame state machine: vehicles, then plates per vehicle, then text per
/// plate, then dedup and persist.
///
/// Owns the single dedup state. At most one plate is persisted per frame.
pub struct Orchestrator<O: Outbox> {
    stages: OrchestratorStages,
    dedup: Deduplicator,
    state: DedupState,
    outbox: O,
    evidence: EvidenceWriter,
    settings: OrchestratorSettings,
    stats: OrchestratorStats,
}

impl<O: Outbox> Orchestrator<O> {
    pub fn new(stages: OrchestratorStages, outbox: O, settings: OrchestratorSettings) -> Self {
        Self {
            stages,
            dedup: Deduplicator::new(settings.thresholds),
            state: DedupState::default(),
            outbox,
            evidence: EvidenceWriter::new(&settings.output_dir),
            settings,
            stats: OrchestratorStats::default(),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    pub fn dedup_state(&self) -> &DedupState {
        &self.state
    }

    pub fn outbox_mut(&mut self) -> &mut O {
        &mut self.outbox
    }

    /// Run the loop until `stop` is set. The flag is checked between frames.
    pub fn run(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) {
        log::info!("orchestrator: reading from {}", source.describe());
        let mut last_report = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            let delay = match self.run_once(source) {
                FrameOutcome::Skipped(_) => self.settings.retry_delay,
                FrameOutcome::Done(_) => self.settings.frame_interval,
            };
            if last_report.elapsed() >= STATS_INTERVAL {
                self.log_stats();
                last_report = Instant::now();
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        self.log_stats();
        log::info!("orchestrator: stopped");
    }

    /// Acquire one frame from `source` and drive it to a terminal state.
    pub fn run_once(&mut self, source: &mut dyn FrameSource) -> FrameOutcome {
        self.drive(FrameState::AcquireFrame, Some(source))
    }

    /// Drive an already captured frame to a terminal state.
    pub fn process_frame(&mut self, frame: Frame) -> FrameOutcome {
        self.drive(FrameState::DetectVehicles(frame), None)
    }

    fn drive(&mut self, mut state: FrameState, mut source: Option<&mut dyn FrameSource>) -> FrameOutcome {
        loop {
            state = match state {
                FrameState::AcquireFrame => match source.as_deref_mut() {
                    Some(source) => acquire(source),
                    None => FrameState::Skipped(StageError::Acquisition("no frame source".into())),
                },
                FrameState::DetectVehicles(frame) => self.detect_vehicles(frame),
                FrameState::ProcessVehicles { frame, vehicles } => {
                    FrameState::Done(self.process_vehicles(&frame, &vehicles))
                }
                FrameState::Done(summary) => {
                    self.stats.frames_processed += 1;
                    self.stats.stage_errors += summary.errors as u64;
                    return FrameOutcome::Done(summary);
                }
                FrameState::Skipped(err) => {
                    self.stats.frames_skipped += 1;
                    log::debug!("orchestrator: cycle skipped: {}", err);
                    return FrameOutcome::Skipped(err);
                }
            };
        }
    }

    fn detect_vehicles(&mut self, frame: Frame) -> FrameState {
        if !frame.is_valid() {
            return FrameState::Skipped(StageError::Acquisition(format!(
                "frame {} has no pixels",
                frame.id
            )));
        }
        match self.stages.vehicle.detect(&frame.image) {
            Ok(detections) if detections.is_empty() => FrameState::Done(FrameSummary {
                frame_id: frame.id,
                ..FrameSummary::default()
            }),
            Ok(detections) => {
                let vehicles = detections.into_iter().map(|d| d.bbox).collect();
                FrameState::ProcessVehicles { frame, vehicles }
            }
            Err(err) => {
                log::warn!(
                    "frame {} @ {}: vehicle stage {}: {}",
                    frame.id,
                    frame.timestamp_label(),
                    err.kind(),
                    err
                );
                FrameState::Done(FrameSummary {
                    frame_id: frame.id,
                    errors: 1,
                    ..FrameSummary::default()
                })
            }
        }
    }

    fn process_vehicles(&mut self, frame: &Frame, vehicles: &[BBox]) -> FrameSummary {
        let mut summary = FrameSummary {
            frame_id: frame.id,
            vehicles: vehicles.len(),
            ..FrameSummary::default()
        };
        let timestamp = frame.timestamp_label();
        let mut plate_index = 0usize;

        'vehicles: for (v_idx, vehicle_box) in vehicles.iter().enumerate() {
            let Some(vehicle) = imaging::crop(&frame.image, vehicle_box) else {
                log::warn!("frame {}: vehicle {} crop is empty, skipped", frame.id, v_idx);
                continue;
            };
            let plates = match self.stages.plate.detect(&vehicle) {
                Ok(plates) => plates,
                Err(err) => {
                    log::warn!(
                        "frame {} @ {}: plate stage on vehicle {}: {}",
                        frame.id,
                        timestamp,
                        v_idx,
                        err
                    );
                    summary.errors += 1;
                    continue;
                }
            };

            for plate in plates {
                let index = plate_index;
                plate_index += 1;
                summary.plates += 1;
                let Some(crop) = imaging::crop(&vehicle, &plate.bbox) else {
                    log::warn!("frame {}: plate {} crop is empty, skipped", frame.id, index);
                    continue;
                };
                match self.handle_plate(frame, &timestamp, index, &vehicle, &plate.bbox, &crop) {
                    PlateOutcome::Accepted(id) => {
                        summary.accepted = Some(id);
                        break 'vehicles;
                    }
                    PlateOutcome::Rejected => summary.rejected += 1,
                    PlateOutcome::Failed(err) => {
                        log::error!("frame {} @ {}: plate {}: {}", frame.id, timestamp, index, err);
                        summary.errors += 1;
                    }
                }
            }
        }
        summary
    }

    fn handle_plate(
        &mut self,
        frame: &Frame,
        timestamp: &str,
        index: usize,
        vehicle: &RgbImage,
        plate_box: &BBox,
        crop: &RgbImage,
    ) -> PlateOutcome {
        let recognition = match self.stages.reader.read(crop) {
            Ok(recognition) => recognition,
            Err(err) => {
                log::warn!(
                    "frame {} @ {}: plate {} treated as unread: {}",
                    frame.id,
                    timestamp,
                    index,
                    err
                );
                self.stats.stage_errors += 1;
                Recognition::empty()
            }
        };

        if let Verdict::Reject(sim) = self.dedup.decide(&recognition.text, crop, &self.state) {
            log::info!(
                "frame {}: '{}' similar to '{}' (text {:.2}, image {:.2}), skipped",
                frame.id,
                recognition.text,
                self.state.last_text().unwrap_or(""),
                sim.text,
                sim.image
            );
            self.stats.rejected += 1;
            return PlateOutcome::Rejected;
        }

        let paths = match self
            .evidence
            .write(timestamp, frame.id, index, &frame.image, vehicle, plate_box, crop)
        {
            Ok(paths) => paths,
            Err(err) => return PlateOutcome::Failed(StageError::Storage(format!("{:#}", err))),
        };
        let record = CandidateRecord {
            license_text: recognition.text.clone(),
            vehicle_image_ref: paths.vehicle,
            plate_image_ref: paths.plate,
            cropped_image_ref: paths.cropped,
            timestamp: timestamp.to_string(),
            location: self.settings.location,
            hostname: self.settings.hostname.clone(),
        };
        match self.outbox.insert(&record) {
            Ok(id) => {
                self.state.update(&recognition.text, crop);
                self.stats.accepted += 1;
                log::info!(
                    "frame {}: saved plate '{}' as record {} ({})",
                    frame.id,
                    recognition.text,
                    id,
                    record.cropped_image_ref
                );
                PlateOutcome::Accepted(id)
            }
            Err(err) => PlateOutcome::Failed(StageError::Storage(format!("{:#}", err))),
        }
    }

    fn log_stats(&self) {
        let s = self.stats;
        log::info!(
            "orchestrator: frames={} skipped={} accepted={} rejected={} stage_errors={}",
            s.frames_processed,
            s.frames_skipped,
            s.accepted,
            s.rejected,
            s.stage_errors
        );
    }
}

fn acquire(source: &mut dyn FrameSource) -> FrameState {
    match source.next_frame() {
        Ok(Some(frame)) => FrameState::DetectVehicles(frame),
        Ok(None) => FrameState::Skipped(StageError::Acquisition(format!(
            "{} returned no frame",
            source.describe()
        ))),
        Err(err) => FrameState::Skipped(StageError::Acquisition(format!("{:#}", err))),
    }
}
