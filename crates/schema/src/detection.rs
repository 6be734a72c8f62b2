use crate::Header;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

/// Box in source image pixels. Which variant appears depends on the model
/// head: a plain detector emits axis-aligned boxes, an OBB head emits
/// oriented ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundingBox2D {
    AxisAligned {
        center: Point2D,
        size: Vector2,
    },
    Oriented {
        center: Point2D,
        size: Vector2,
        /// Rotation in radians.
        theta: f64,
    },
}

impl BoundingBox2D {
    pub fn center(&self) -> Point2D {
        match self {
            BoundingBox2D::AxisAligned { center, .. } | BoundingBox2D::Oriented { center, .. } => {
                *center
            }
        }
    }

    pub fn size(&self) -> Vector2 {
        match self {
            BoundingBox2D::AxisAligned { size, .. } | BoundingBox2D::Oriented { size, .. } => *size,
        }
    }

    pub fn theta(&self) -> Option<f64> {
        match self {
            BoundingBox2D::AxisAligned { .. } => None,
            BoundingBox2D::Oriented { theta, .. } => Some(*theta),
        }
    }
}

/// Polygon outline of an instance plus the size of the image it was traced on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub height: u32,
    pub width: u32,
    pub data: Vec<Point2D>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint2D {
    /// 1-based position among the keypoints kept for the instance.
    pub id: i32,
    pub point: Point2D,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint2DArray {
    pub data: Vec<KeyPoint2D>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i32,
    pub class_name: String,
    pub score: f64,
    pub bbox: BoundingBox2D,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mask: Option<Mask>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub keypoints: Option<KeyPoint2DArray>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionArray {
    pub header: Header,
    pub detections: Vec<Detection>,
}
