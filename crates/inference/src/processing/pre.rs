//! Conversion between wire images and the pixel arrays a model consumes.

use common::span_debug;
use ndarray::Array3;
use schema::{Header, Image};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Unsupported image encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Row step {step} is smaller than one row of pixels ({min} bytes)")]
    InvalidStep { step: u32, min: usize },

    #[error("Image data truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Pixel buffer does not match image shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Mono8,
}

impl PixelEncoding {
    pub fn channels(&self) -> usize {
        match self {
            PixelEncoding::Rgb8 | PixelEncoding::Bgr8 => 3,
            PixelEncoding::Rgba8 | PixelEncoding::Bgra8 => 4,
            PixelEncoding::Mono8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelEncoding::Rgb8 => "rgb8",
            PixelEncoding::Bgr8 => "bgr8",
            PixelEncoding::Rgba8 => "rgba8",
            PixelEncoding::Bgra8 => "bgra8",
            PixelEncoding::Mono8 => "mono8",
        }
    }

    fn to_rgba(self, px: &[u8]) -> [u8; 4] {
        match self {
            PixelEncoding::Rgb8 => [px[0], px[1], px[2], 255],
            PixelEncoding::Bgr8 => [px[2], px[1], px[0], 255],
            PixelEncoding::Rgba8 => [px[0], px[1], px[2], px[3]],
            PixelEncoding::Bgra8 => [px[2], px[1], px[0], px[3]],
            PixelEncoding::Mono8 => [px[0], px[0], px[0], 255],
        }
    }

    fn write_rgba(self, [r, g, b, a]: [u8; 4], out: &mut Vec<u8>) {
        match self {
            PixelEncoding::Rgb8 => out.extend_from_slice(&[r, g, b]),
            PixelEncoding::Bgr8 => out.extend_from_slice(&[b, g, r]),
            PixelEncoding::Rgba8 => out.extend_from_slice(&[r, g, b, a]),
            PixelEncoding::Bgra8 => out.extend_from_slice(&[b, g, r, a]),
            PixelEncoding::Mono8 => out.push(luma(r, g, b)),
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelEncoding {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rgb8" => Ok(PixelEncoding::Rgb8),
            "bgr8" | "8UC3" => Ok(PixelEncoding::Bgr8),
            "rgba8" => Ok(PixelEncoding::Rgba8),
            "bgra8" | "8UC4" => Ok(PixelEncoding::Bgra8),
            "mono8" | "8UC1" => Ok(PixelEncoding::Mono8),
            other => Err(ConvertError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// ITU-R BT.601 luma.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// Decoded pixels, `(height, width, channels)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub pixels: Array3<u8>,
    pub encoding: PixelEncoding,
}

impl DecodedImage {
    pub fn height(&self) -> u32 {
        self.pixels.shape()[0] as u32
    }

    pub fn width(&self) -> u32 {
        self.pixels.shape()[1] as u32
    }

    /// Packed copy of the pixels in `target` order.
    pub fn to_packed(&self, target: PixelEncoding) -> Vec<u8> {
        let src: Vec<u8> = self.pixels.iter().copied().collect();
        if target == self.encoding {
            return src;
        }

        let channels = self.encoding.channels();
        let mut out = Vec::with_capacity(src.len() / channels * target.channels());
        for px in src.chunks_exact(channels) {
            target.write_rgba(self.encoding.to_rgba(px), &mut out);
        }
        out
    }
}

/// Converts between wire images and [`DecodedImage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageConverter;

impl ImageConverter {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, msg: &Image, desired: PixelEncoding) -> Result<DecodedImage, ConvertError> {
        let _s = span_debug!("decode_image");
        let source: PixelEncoding = msg.encoding.parse()?;

        if msg.width == 0 || msg.height == 0 {
            return Err(ConvertError::EmptyImage {
                width: msg.width,
                height: msg.height,
            });
        }

        let width = msg.width as usize;
        let height = msg.height as usize;
        let row_bytes = width * source.channels();
        if (msg.step as usize) < row_bytes {
            return Err(ConvertError::InvalidStep {
                step: msg.step,
                min: row_bytes,
            });
        }

        let step = msg.step as usize;
        let expected = step * (height - 1) + row_bytes;
        if msg.data.len() < expected {
            return Err(ConvertError::Truncated {
                expected,
                actual: msg.data.len(),
            });
        }

        let mut out = Vec::with_capacity(width * height * desired.channels());
        for y in 0..height {
            let row = &msg.data[y * step..y * step + row_bytes];
            if source == desired {
                out.extend_from_slice(row);
            } else {
                for px in row.chunks_exact(source.channels()) {
                    desired.write_rgba(source.to_rgba(px), &mut out);
                }
            }
        }

        let pixels = Array3::from_shape_vec((height, width, desired.channels()), out)?;
        Ok(DecodedImage {
            pixels,
            encoding: desired,
        })
    }

    pub fn encode(&self, image: &DecodedImage, header: Header) -> Image {
        let width = image.width();
        let step = width * image.encoding.channels() as u32;
        Image::new(
            header,
            width,
            image.height(),
            image.encoding.as_str(),
            step,
            image.pixels.iter().copied().collect(),
        )
    }
}
