//! Logger setup shared by the binaries.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};

/// Initialise `env_logger` with `info` as the default filter (`RUST_LOG`
/// overrides it). With `file` set, lines are appended there instead of
/// stderr.
pub fn init(file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(sink)));
    }
    builder
        .try_init()
        .context("logger already initialised")?;
    Ok(())
}
