use bridge::{QosProfile, Reliability};
use common::{Environment, LogLevel};
use inference::{InferenceParams, ModelType, PixelEncoding};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f32 },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Declared node parameters. Read at startup and replaceable while the node
/// is unconfigured; [`NodeConfig::validate`] turns them into the snapshot a
/// configured node runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub model_type: String,
    pub model: String,
    pub device: String,
    pub yolo_encoding: String,
    pub enable: bool,
    pub image_reliability: String,
    pub threshold: f32,
    pub iou: f32,
    pub imgsz_height: u32,
    pub imgsz_width: u32,
    pub half: bool,
    pub max_det: usize,
    pub augment: bool,
    pub agnostic_nms: bool,
    pub retina_masks: bool,
    pub publish_result_img: bool,
    pub auto_activate: bool,
    pub namespace: String,
    pub labels_path: Option<PathBuf>,
    pub environment: Environment,
    pub log_level: LogLevel,
    pub otel_endpoint: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            model_type: "YOLO".to_string(),
            model: "yolo11n.onnx".to_string(),
            device: "cpu".to_string(),
            yolo_encoding: "bgr8".to_string(),
            enable: true,
            image_reliability: "reliable".to_string(),
            threshold: 0.5,
            iou: 0.5,
            imgsz_height: 640,
            imgsz_width: 640,
            half: false,
            max_det: 300,
            augment: false,
            agnostic_nms: false,
            retina_masks: false,
            publish_result_img: false,
            auto_activate: true,
            namespace: "yolo".to_string(),
            labels_path: None,
            environment: Environment::Development,
            log_level: LogLevel::Info,
            otel_endpoint: None,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            model_type: env_string("MODEL_TYPE", &d.model_type),
            model: env_string("MODEL", &d.model),
            device: env_string("DEVICE", &d.device),
            yolo_encoding: env_string("YOLO_ENCODING", &d.yolo_encoding),
            enable: env_or("ENABLE", d.enable),
            image_reliability: env_string("IMAGE_RELIABILITY", &d.image_reliability),
            threshold: env_or("THRESHOLD", d.threshold),
            iou: env_or("IOU", d.iou),
            imgsz_height: env_or("IMGSZ_HEIGHT", d.imgsz_height),
            imgsz_width: env_or("IMGSZ_WIDTH", d.imgsz_width),
            half: env_or("HALF", d.half),
            max_det: env_or("MAX_DET", d.max_det),
            augment: env_or("AUGMENT", d.augment),
            agnostic_nms: env_or("AGNOSTIC_NMS", d.agnostic_nms),
            retina_masks: env_or("RETINA_MASKS", d.retina_masks),
            publish_result_img: env_or("PUBLISH_RESULT_IMG", d.publish_result_img),
            auto_activate: env_or("AUTO_ACTIVATE", d.auto_activate),
            namespace: env_string("NODE_NAMESPACE", &d.namespace),
            labels_path: env::var("LABELS_PATH").ok().map(PathBuf::from),
            environment: Environment::from_env(),
            log_level: LogLevel::from_env(),
            otel_endpoint: env::var("OTEL_ENDPOINT").ok(),
        }
    }

    pub fn validate(&self) -> Result<Configuration, ConfigError> {
        for (name, value) in [("threshold", self.threshold), ("iou", self.iou)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { name, value });
            }
        }
        if self.imgsz_height == 0 {
            return Err(ConfigError::Zero { name: "imgsz_height" });
        }
        if self.imgsz_width == 0 {
            return Err(ConfigError::Zero { name: "imgsz_width" });
        }
        if self.max_det == 0 {
            return Err(ConfigError::Zero { name: "max_det" });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "model",
                reason: "empty model identifier".to_string(),
            });
        }

        let model_type = self
            .model_type
            .parse::<ModelType>()
            .map_err(|e| ConfigError::Invalid {
                name: "model_type",
                reason: e.to_string(),
            })?;
        let encoding = self
            .yolo_encoding
            .parse::<PixelEncoding>()
            .map_err(|e| ConfigError::Invalid {
                name: "yolo_encoding",
                reason: e.to_string(),
            })?;
        let reliability = self
            .image_reliability
            .parse::<Reliability>()
            .map_err(|e| ConfigError::Invalid {
                name: "image_reliability",
                reason: e.to_string(),
            })?;

        Ok(Configuration {
            model_type,
            model: self.model.clone(),
            encoding,
            reliability,
            enable: self.enable,
            publish_result_img: self.publish_result_img,
            auto_activate: self.auto_activate,
            inference: InferenceParams {
                confidence: self.threshold,
                iou: self.iou,
                image_size: (self.imgsz_height, self.imgsz_width),
                half: self.half,
                max_det: self.max_det,
                augment: self.augment,
                agnostic_nms: self.agnostic_nms,
                retina_masks: self.retina_masks,
                device: self.device.clone(),
            },
        })
    }
}

/// Immutable snapshot taken at configure time.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub model_type: ModelType,
    pub model: String,
    pub encoding: PixelEncoding,
    pub reliability: Reliability,
    pub enable: bool,
    pub publish_result_img: bool,
    pub auto_activate: bool,
    pub inference: InferenceParams,
}

impl Configuration {
    pub fn device(&self) -> &str {
        &self.inference.device
    }

    /// Image input profile: newest frame only.
    pub fn image_qos(&self) -> QosProfile {
        QosProfile::sensor_data(self.reliability)
    }
}
