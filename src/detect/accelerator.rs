use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::backend::{InferenceBackend, InferenceOutput};

/// Per-model call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub calls: u64,
    pub errors: u64,
}

struct Device {
    backends: HashMap<String, Box<dyn InferenceBackend>>,
    stats: HashMap<String, ModelStats>,
}

/// The inference device shared by every detection stage.
///
/// One `Mutex` guards all loaded models, so at most one inference call is in
/// flight at a time no matter how many stages or orchestrators hold an
/// `Arc<Accelerator>`.
pub struct Accelerator {
    device: Mutex<Device>,
}

impl Accelerator {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(Device {
                backends: HashMap::new(),
                stats: HashMap::new(),
            }),
        }
    }

    /// Load a backend under a model name. Replaces any backend with that name.
    pub fn register<B: InferenceBackend + 'static>(&self, model: &str, mut backend: B) -> Result<()> {
        backend.warm_up()?;
        let mut device = self
            .device
            .lock()
            .map_err(|_| anyhow!("accelerator lock poisoned"))?;
        log::info!("accelerator: loaded model '{}' on {} backend", model, backend.name());
        device.backends.insert(model.to_string(), Box::new(backend));
        device.stats.entry(model.to_string()).or_default();
        Ok(())
    }

    pub fn contains(&self, model: &str) -> bool {
        self.device
            .lock()
            .map(|device| device.backends.contains_key(model))
            .unwrap_or(false)
    }

    /// List loaded model names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .device
            .lock()
            .map(|device| device.backends.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Run one inference call while holding the device lock.
    pub fn run(&self, model: &str, image: &RgbImage) -> Result<InferenceOutput> {
        let mut device = self
            .device
            .lock()
            .map_err(|_| anyhow!("accelerator lock poisoned"))?;
        let Device { backends, stats } = &mut *device;
        let backend = backends
            .get_mut(model)
            .ok_or_else(|| anyhow!("model '{}' not loaded", model))?;
        let result = backend.infer(image);
        let entry = stats.entry(model.to_string()).or_default();
        entry.calls += 1;
        if result.is_err() {
            entry.errors += 1;
        }
        result
    }

    pub fn stats(&self, model: &str) -> Option<ModelStats> {
        self.device
            .lock()
            .ok()
            .and_then(|device| device.stats.get(model).copied())
    }
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::new()
    }
}
