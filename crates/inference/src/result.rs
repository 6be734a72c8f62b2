//! Raw detector output, before normalization.
//!
//! Mirrors what a detection library hands back for one image: up to four
//! independent per-instance arrays, each present only if the model head
//! produces it. Coordinates are in source image pixels.

use ndarray::{Array1, Array2};

/// Axis-aligned boxes as `(N, 4)` rows of `[cx, cy, w, h]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Boxes {
    pub xywh: Array2<f32>,
    pub cls: Array1<u32>,
    pub conf: Array1<f32>,
}

impl Boxes {
    pub fn len(&self) -> usize {
        self.xywh.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Oriented boxes as `(N, 5)` rows of `[cx, cy, w, h, angle]`, angle in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedBoxes {
    pub xywhr: Array2<f32>,
    pub cls: Array1<u32>,
    pub conf: Array1<f32>,
}

impl OrientedBoxes {
    pub fn len(&self) -> usize {
        self.xywhr.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Segmentation outlines. Each instance has zero or more contours of `(M, 2)`
/// points, largest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Masks {
    pub contours: Vec<Vec<Array2<f32>>>,
}

impl Masks {
    pub fn len(&self) -> usize {
        self.contours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contours.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeypointInstance {
    /// `(K, 2)` keypoint coordinates.
    pub xy: Array2<f32>,
    /// Per-keypoint visibility scores, absent when the model does not emit them.
    pub conf: Option<Array1<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Keypoints {
    pub instances: Vec<KeypointInstance>,
}

impl Keypoints {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    /// Source image `(height, width)`.
    pub orig_shape: (u32, u32),
    pub boxes: Option<Boxes>,
    pub obb: Option<OrientedBoxes>,
    pub masks: Option<Masks>,
    pub keypoints: Option<Keypoints>,
}

impl RawResult {
    pub fn empty(orig_shape: (u32, u32)) -> Self {
        Self {
            orig_shape,
            boxes: None,
            obb: None,
            masks: None,
            keypoints: None,
        }
    }
}
