use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::imaging;
use crate::storage::{Outbox, PersistedRecord};

use super::collector::Collector;
use super::payload::{DeliveryPayload, ResponseStatus};
use super::DeliveryError;

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct DeliverySettings {
    pub checkpoint_id: String,
    pub poll_interval: Duration,
    pub backoff_max: Duration,
    pub jpeg_max_side: u32,
    pub jpeg_quality: u8,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            checkpoint_id: "checkpoint-0".to_string(),
            poll_interval: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            jpeg_max_side: 640,
            jpeg_quality: 50,
        }
    }
}

/// Exponential delay after connection failures: starts at the poll interval,
/// doubles up to the cap, resets on any response.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    /// Register a failure and return the delay before the next attempt.
    pub fn fail(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}

/// Result of one poll. Each variant names the record it touched.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Idle,
    Sent(i64),
    /// Rejected by the collector; kept for re-queue.
    Failed(i64),
    /// No usable answer; the record stays pending.
    Unreachable(i64),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: u64,
    pub failed: u64,
    pub connection_errors: u64,
}

pub struct DeliveryWorker<O: Outbox, C: Collector> {
    outbox: O,
    collector: C,
    settings: DeliverySettings,
    backoff: Backoff,
    stats: DeliveryStats,
}

impl<O: Outbox, C: Collector> DeliveryWorker<O, C> {
    pub fn new(outbox: O, collector: C, settings: DeliverySettings) -> Self {
        let backoff = Backoff::new(settings.poll_interval, settings.backoff_max);
        Self {
            outbox,
            collector,
            settings,
            backoff,
            stats: DeliveryStats::default(),
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    pub fn outbox_mut(&mut self) -> &mut O {
        &mut self.outbox
    }

    pub fn collector_mut(&mut self) -> &mut C {
        &mut self.collector
    }

    /// Deliver at most one record and apply the collector's answer to it.
    pub fn poll_once(&mut self) -> Result<PollOutcome> {
        let Some(record) = self.outbox.next_pending()? else {
            return Ok(PollOutcome::Idle);
        };
        let image = self.encode_image(&record);
        let payload = DeliveryPayload::build(&record, &self.settings.checkpoint_id, image);

        let answer = self
            .collector
            .send(&payload)
            .and_then(|response| match response.status {
                ResponseStatus::Success => Ok(response.message),
                ResponseStatus::Error => Err(DeliveryError::Rejected(response.message)),
            });

        match answer {
            Ok(message) => {
                self.backoff.reset();
                self.outbox.mark_sent(record.id)?;
                self.stats.sent += 1;
                log::info!(
                    "delivery: record {} '{}' sent: {}",
                    record.id,
                    record.record.license_text,
                    message
                );
                Ok(PollOutcome::Sent(record.id))
            }
            Err(DeliveryError::Rejected(message)) => {
                self.backoff.reset();
                self.outbox.mark_failed(record.id, &message)?;
                self.stats.failed += 1;
                log::warn!("delivery: record {} rejected: {}", record.id, message);
                Ok(PollOutcome::Failed(record.id))
            }
            Err(DeliveryError::Connection(reason)) => {
                self.stats.connection_errors += 1;
                log::warn!("delivery: record {} left pending: {}", record.id, reason);
                Ok(PollOutcome::Unreachable(record.id))
            }
        }
    }

    /// Delay before the next poll after `outcome`.
    pub fn next_delay(&mut self, outcome: &PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Idle => self.settings.poll_interval,
            PollOutcome::Sent(_) | PollOutcome::Failed(_) => Duration::ZERO,
            PollOutcome::Unreachable(_) => self.backoff.fail(),
        }
    }

    /// Run until `stop` is set. The flag is checked between send/response
    /// cycles and while waiting.
    pub fn run(&mut self, stop: &AtomicBool) {
        log::info!(
            "delivery: worker started (poll every {:?}, backoff up to {:?})",
            self.settings.poll_interval,
            self.settings.backoff_max
        );
        let mut last_report = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            let delay = match self.poll_once() {
                Ok(outcome) => self.next_delay(&outcome),
                Err(err) => {
                    log::error!("delivery: outbox error: {:#}", err);
                    self.settings.poll_interval
                }
            };
            if last_report.elapsed() >= STATS_INTERVAL {
                self.log_stats();
                last_report = Instant::now();
            }
            sleep_unless_stopped(delay, stop);
        }
        self.log_stats();
        log::info!("delivery: worker stopped");
    }

    fn encode_image(&self, record: &PersistedRecord) -> String {
        let path = &record.record.plate_image_ref;
        let encoded = imaging::load_rgb(Path::new(path)).and_then(|img| {
            imaging::encode_jpeg_base64(&img, self.settings.jpeg_max_side, self.settings.jpeg_quality)
        });
        match encoded {
            Ok(image) => {
                log::debug!("delivery: record {} image {:.2} KB", record.id, image.len() as f64 / 1024.0);
                image
            }
            Err(err) => {
                log::error!("delivery: record {} sent without image: {:#}", record.id, err);
                String::new()
            }
        }
    }

    fn log_stats(&self) {
        log::info!(
            "delivery: sent={} failed={} connection_errors={}",
            self.stats.sent,
            self.stats.failed,
            self.stats.connection_errors
        );
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
