//! lpr_sender - delivery worker only
//!
//! Drains the outbox to the collector while the detection side runs in a
//! separate process (or not at all).

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lpr_edge::config::PipelineConfig;
use lpr_edge::{logging, DeliveryWorker, HttpCollector, Outbox, SqliteOutbox};

fn main() -> Result<()> {
    let cfg = PipelineConfig::load()?;
    logging::init(cfg.log_file.as_deref())?;

    let mut outbox = SqliteOutbox::open(&cfg.db_path)?;
    let counts = outbox.counts()?;
    log::info!(
        "lpr_sender: outbox {} has {} pending, {} failed, {} sent",
        cfg.db_path,
        counts.pending,
        counts.failed,
        counts.sent
    );
    let collector = HttpCollector::new(&cfg.delivery.server_url, cfg.delivery.timeout)?;
    log::info!("lpr_sender: sending to {}", collector.url());

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    DeliveryWorker::new(outbox, collector, cfg.delivery_settings()).run(&stop);
    Ok(())
}
