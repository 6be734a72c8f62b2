use crate::Header;
use serde::{Deserialize, Serialize};

/// Uncompressed 2D pixel buffer.
///
/// `step` is the row length in bytes, `encoding` names the pixel layout
/// (`rgb8`, `bgr8`, `mono8`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    pub is_bigendian: u8,
    pub step: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(
        header: Header,
        width: u32,
        height: u32,
        encoding: impl Into<String>,
        step: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            header,
            height,
            width,
            encoding: encoding.into(),
            is_bigendian: 0,
            step,
            data,
        }
    }
}
