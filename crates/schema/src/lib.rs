//! Message types exchanged on the bus.
//!
//! Field layout follows the usual robotics conventions: every stream message
//! carries a [`Header`] copied from the image it was derived from.

mod detection;
mod header;
mod image;
mod service;

pub use detection::{
    BoundingBox2D, Detection, DetectionArray, KeyPoint2D, KeyPoint2DArray, Mask, Point2D, Vector2,
};
pub use header::{Header, Time};
pub use image::Image;
pub use service::{SetBoolRequest, SetBoolResponse, SetClassesRequest, SetClassesResponse};
