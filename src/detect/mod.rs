mod accelerator;
mod backend;
mod backends;
mod model_config;
mod nms;
mod postprocess;
mod result;
mod stage;

pub use accelerator::{Accelerator, ModelStats};
pub use backend::{InferenceBackend, InferenceOutput};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use model_config::{ConfigError, ModelConfig};
pub use nms::non_max_suppression;
pub use postprocess::{DecodeError, Postprocessor, Prior, Quantization, RawTensor, TensorData};
pub use result::{BBox, Detection};
pub use stage::DetectionStage;
