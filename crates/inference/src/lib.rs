pub mod backend;
pub mod labels;
pub mod processing;
pub mod result;

pub use backend::{
    Capabilities, Detector, DetectorLoader, InferenceError, InferenceParams, ModelSpec, ModelType,
    is_cuda_device,
};
pub use processing::post::{Hypothesis, Instance, InstanceKeypoints, NormalizeError, ResultNormalizer};
pub use processing::pre::{ConvertError, DecodedImage, ImageConverter, PixelEncoding};
pub use result::RawResult;
