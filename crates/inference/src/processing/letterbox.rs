//! Aspect-preserving resize onto a padded network input.

use common::span;
use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};
use ndarray::{Array, IxDyn};

const LETTERBOX_COLOR: u8 = 114;

/// Mapping between source pixels and letterboxed network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub resized: (u32, u32),
}

impl Letterbox {
    /// Fit `(width, height)` inside `target` given as `(height, width)`.
    pub fn fit(width: u32, height: u32, target: (u32, u32)) -> Self {
        let (target_h, target_w) = target;
        let scale = (target_w as f32 / width as f32).min(target_h as f32 / height as f32);
        let new_width = ((width as f32 * scale).round() as u32).clamp(1, target_w);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, target_h);

        Self {
            scale,
            pad_x: ((target_w - new_width) / 2) as f32,
            pad_y: ((target_h - new_height) / 2) as f32,
            resized: (new_width, new_height),
        }
    }

    /// Network input coordinates back to source pixels.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    pub fn length_to_source(&self, length: f32) -> f32 {
        length / self.scale
    }
}

pub struct LetterboxPreprocessor {
    buffer: Vec<u8>,
}

impl LetterboxPreprocessor {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Resize packed RGB pixels into a `[1, 3, H, W]` tensor scaled to `[0, 1]`.
    pub fn run(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        target: (u32, u32),
    ) -> anyhow::Result<(Array<f32, IxDyn>, Letterbox)> {
        let _s = span!("letterbox");

        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            anyhow::bail!(
                "Buffer size mismatch: expected {} bytes, got {}",
                expected,
                rgb.len()
            );
        }

        let (target_h, target_w) = target;
        let letterbox = Letterbox::fit(width, height, target);
        let (new_width, new_height) = letterbox.resized;

        let src = ImageRef::new(width, height, rgb, PixelType::U8x3)?;
        let mut resized = Image::new(new_width, new_height, PixelType::U8x3);
        Resizer::new().resize(
            &src,
            &mut resized,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )?;

        self.buffer.clear();
        self.buffer
            .resize(target_w as usize * target_h as usize * 3, LETTERBOX_COLOR);

        let resized_data = resized.buffer();
        let row_bytes = new_width as usize * 3;
        let stride = target_w as usize * 3;
        let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

        for y in 0..new_height as usize {
            let src_row = y * row_bytes;
            let dst_row = (y + pad_y) * stride + pad_x * 3;
            self.buffer[dst_row..dst_row + row_bytes]
                .copy_from_slice(&resized_data[src_row..src_row + row_bytes]);
        }

        let spatial = target_w as usize * target_h as usize;
        let mut output = vec![0.0f32; 3 * spatial];
        for (i, px) in self.buffer.chunks_exact(3).enumerate() {
            output[i] = px[0] as f32 / 255.0;
            output[i + spatial] = px[1] as f32 / 255.0;
            output[i + 2 * spatial] = px[2] as f32 / 255.0;
        }

        let tensor = Array::from_shape_vec(
            IxDyn(&[1, 3, target_h as usize, target_w as usize]),
            output,
        )?;
        Ok((tensor, letterbox))
    }
}

impl Default for LetterboxPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}
