//! lprd - edge license plate daemon
//!
//! Runs two independent loops until Ctrl-C:
//! 1. The orchestrator: frame -> vehicles -> plates -> text -> dedup -> outbox
//! 2. The delivery worker: outbox -> remote collector, with backoff
//!
//! The loops share nothing but the outbox database; each holds its own
//! connection.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use lpr_edge::config::PipelineConfig;
use lpr_edge::ingest::open_source;
use lpr_edge::{
    location, logging, Accelerator, DeliveryWorker, DetectionStage, EmptyRecognizer,
    HttpCollector, ModelConfig, Orchestrator, OrchestratorStages, PlateModelRecognizer,
    PlateReader, RecognitionMode, SqliteOutbox, StubBackend, TextRecognizer,
};

fn main() -> Result<()> {
    let cfg = PipelineConfig::load()?;
    logging::init(cfg.log_file.as_deref())?;

    log::info!(
        "lprd {} starting: checkpoint={}, host={}, outbox={}",
        env!("CARGO_PKG_VERSION"),
        cfg.checkpoint_id,
        cfg.hostname,
        cfg.db_path
    );
    let location = location::resolve(cfg.location, cfg.delivery.timeout);

    let accelerator = Arc::new(Accelerator::new());
    let stages = build_stages(&cfg, &accelerator)?;
    log::info!(
        "models loaded: {:?}; recognition mode {}",
        accelerator.list(),
        stages.reader.mode()
    );

    let outbox = SqliteOutbox::open(&cfg.db_path)?;
    let mut source = open_source(&cfg.source)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    let sender = {
        let stop = stop.clone();
        let db_path = cfg.db_path.clone();
        let server_url = cfg.delivery.server_url.clone();
        let timeout = cfg.delivery.timeout;
        let settings = cfg.delivery_settings();
        thread::Builder::new()
            .name("delivery".into())
            .spawn(move || -> Result<()> {
                let outbox = SqliteOutbox::open(&db_path)?;
                let collector = HttpCollector::new(&server_url, timeout)?;
                log::info!("delivery: sending to {}", collector.url());
                DeliveryWorker::new(outbox, collector, settings).run(&stop);
                Ok(())
            })?
    };

    let mut orchestrator = Orchestrator::new(stages, outbox, cfg.orchestrator_settings(location));
    orchestrator.run(source.as_mut(), &stop);

    // The worker may have failed to start; stop it either way.
    stop.store(true, Ordering::SeqCst);
    match sender.join() {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("delivery thread panicked")),
    }
    log::info!("lprd stopped");
    Ok(())
}

fn build_stages(cfg: &PipelineConfig, accelerator: &Arc<Accelerator>) -> Result<OrchestratorStages> {
    let vehicle = load_stage("vehicle", cfg.models.vehicle.as_deref(), accelerator)?;
    let plate = load_stage("plate", cfg.models.plate.as_deref(), accelerator)?;

    let ocr_path = cfg.models.ocr.as_deref();
    let reader = match ocr_path {
        Some(path) => {
            let ocr = load_stage("ocr", Some(path), accelerator)?;
            let fallback = load_stage("ocr", Some(path), accelerator)?;
            PlateReader::new(
                cfg.recognition_mode,
                Box::new(PlateModelRecognizer::new(fallback)),
            )
            .with_ocr_model(Box::new(PlateModelRecognizer::new(ocr)))
        }
        None => {
            if cfg.recognition_mode != RecognitionMode::OcrModel {
                log::warn!("no ocr model configured; plates will be recorded without text");
            }
            let fallback: Box<dyn TextRecognizer> = Box::new(EmptyRecognizer);
            PlateReader::new(cfg.recognition_mode, fallback)
        }
    };

    Ok(OrchestratorStages {
        vehicle,
        plate,
        reader,
    })
}

/// Load a model's JSON blob and register a backend for it.
///
/// With the `backend-tract` feature the ONNX weights are expected next to the
/// blob (`<name>.onnx`). Without weights or without a blob the model runs on
/// the stub backend and detects nothing.
fn load_stage(
    name: &str,
    blob: Option<&Path>,
    accelerator: &Arc<Accelerator>,
) -> Result<DetectionStage> {
    let config = match blob {
        Some(path) => ModelConfig::from_path(path)
            .map_err(|e| anyhow!("model '{}' ({}): {}", name, path.display(), e))?,
        None => {
            log::warn!("no {} model configured; using stub backend", name);
            stub_config(name)
        }
    };

    if !accelerator.contains(name) {
        #[cfg(feature = "backend-tract")]
        {
            if let Some(weights) = blob.map(|p| p.with_extension("onnx")).filter(|p| p.exists()) {
                let backend = lpr_edge::detect::TractBackend::new(
                    &weights,
                    config.input_width,
                    config.input_height,
                )?;
                accelerator.register(name, backend)?;
            }
        }
        if !accelerator.contains(name) {
            if blob.is_some() {
                log::warn!("no weights for {} model; using stub backend", name);
            }
            accelerator.register(name, StubBackend::new())?;
        }
    }

    DetectionStage::new(name, accelerator.clone(), config)
        .map_err(|e| anyhow!("model '{}': {}", name, e))
}

fn stub_config(name: &str) -> ModelConfig {
    ModelConfig {
        input_width: 640,
        input_height: 640,
        strides: vec![8, 16, 32],
        reg_max: 16,
        conf_threshold: 0.3,
        nms_iou_threshold: 0.6,
        num_classes: 1,
        labels: HashMap::from([(0, name.to_string())]),
    }
}
