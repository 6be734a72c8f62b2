use crate::processing::pre::DecodedImage;
use crate::processing::render;
use crate::result::RawResult;
use ndarray::Array3;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "ort-backend")]
pub mod ort;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model artifact not found: {0}")]
    ModelNotFound(String),

    #[error("Unknown model type '{0}', expected YOLO or World")]
    UnknownModelType(String),

    #[error("Model type {model_type} is not supported by the {backend} backend")]
    UnsupportedModelType {
        model_type: ModelType,
        backend: &'static str,
    },

    #[error("Invalid model output: {0}")]
    InvalidOutput(String),

    #[error("Operation not supported by this detector: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Detector family. `World` models accept a caller-defined vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelType {
    #[default]
    Yolo,
    World,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Yolo => "YOLO",
            ModelType::World => "World",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yolo" => Ok(ModelType::Yolo),
            "world" | "yoloworld" => Ok(ModelType::World),
            _ => Err(InferenceError::UnknownModelType(s.to_string())),
        }
    }
}

/// What a loaded detector can do beyond plain inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Class vocabulary can be replaced at runtime via [`Detector::set_classes`].
    pub open_vocabulary: bool,
}

/// Parameters forwarded to every inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub confidence: f32,
    pub iou: f32,
    /// Network input `(height, width)`.
    pub image_size: (u32, u32),
    pub half: bool,
    pub max_det: usize,
    pub augment: bool,
    pub agnostic_nms: bool,
    pub retina_masks: bool,
    pub device: String,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.5,
            image_size: (640, 640),
            half: false,
            max_det: 300,
            augment: false,
            agnostic_nms: false,
            retina_masks: false,
            device: "cpu".to_string(),
        }
    }
}

/// Whether a device string names a CUDA device (`cuda`, `cuda:1`, ...).
pub fn is_cuda_device(device: &str) -> bool {
    device.to_ascii_lowercase().contains("cuda")
}

pub trait Detector: Send {
    /// Current label table, indexed by class id.
    fn names(&self) -> &[String];

    fn infer(
        &mut self,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<RawResult, InferenceError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Fuse layers for faster inference. Failure is not fatal to the caller.
    fn fuse(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Replace the class vocabulary. Only meaningful when
    /// [`Capabilities::open_vocabulary`] is set.
    fn set_classes(&mut self, _classes: &[String]) -> Result<(), InferenceError> {
        Err(InferenceError::Unsupported("set_classes"))
    }

    /// Release device memory held by the detector. Called right before the
    /// handle is dropped.
    fn release(&mut self) {}

    /// Annotated copy of `image` in BGR order.
    fn plot(&self, image: &DecodedImage, result: &RawResult) -> Result<Array3<u8>, InferenceError> {
        Ok(render::plot(image, result)?)
    }
}

pub struct ModelSpec<'a> {
    pub model_type: ModelType,
    pub model: &'a str,
    pub device: &'a str,
}

pub trait DetectorLoader {
    /// Load a fresh detector. A missing artifact maps to
    /// [`InferenceError::ModelNotFound`].
    fn load(&self, spec: &ModelSpec<'_>) -> Result<Box<dyn Detector>, InferenceError>;
}
