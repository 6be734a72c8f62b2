use crate::processing::pre::{DecodedImage, PixelEncoding};
use crate::result::RawResult;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use ndarray::{Array2, Array3};

const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

const KEYPOINT_RADIUS: i32 = 3;
const KEYPOINT_MIN_SCORE: f32 = 0.5;

pub fn color_for(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Draw boxes, mask outlines and keypoints over `image`. Returns BGR pixels.
pub fn plot(image: &DecodedImage, result: &RawResult) -> anyhow::Result<Array3<u8>> {
    let (width, height) = (image.width(), image.height());
    let mut canvas = RgbImage::from_raw(width, height, image.to_packed(PixelEncoding::Rgb8))
        .ok_or_else(|| anyhow::anyhow!("Pixel buffer too small for {}x{}", width, height))?;

    let classes: Vec<u32> = match (&result.boxes, &result.obb) {
        (Some(boxes), _) if !boxes.is_empty() => boxes.cls.to_vec(),
        (_, Some(obb)) => obb.cls.to_vec(),
        _ => Vec::new(),
    };
    let color_of = |i: usize| color_for(classes.get(i).copied().unwrap_or(0));

    if let Some(masks) = &result.masks {
        for (i, contours) in masks.contours.iter().enumerate() {
            for contour in contours {
                draw_polygon_outline(&mut canvas, contour, color_of(i));
            }
        }
    }

    match (&result.boxes, &result.obb) {
        (Some(boxes), _) if !boxes.is_empty() => {
            for (i, row) in boxes.xywh.rows().into_iter().enumerate() {
                draw_axis_box(&mut canvas, [row[0], row[1], row[2], row[3]], color_of(i));
            }
        }
        (_, Some(obb)) => {
            for (i, row) in obb.xywhr.rows().into_iter().enumerate() {
                let corners = rotated_corners([row[0], row[1], row[2], row[3], row[4]]);
                for k in 0..4 {
                    draw_line_segment_mut(&mut canvas, corners[k], corners[(k + 1) % 4], color_of(i));
                }
            }
        }
        _ => {}
    }

    if let Some(keypoints) = &result.keypoints {
        for (i, instance) in keypoints.instances.iter().enumerate() {
            for (k, p) in instance.xy.rows().into_iter().enumerate() {
                let visible = instance
                    .conf
                    .as_ref()
                    .is_none_or(|conf| conf.get(k).is_some_and(|s| *s >= KEYPOINT_MIN_SCORE));
                if visible {
                    draw_filled_circle_mut(
                        &mut canvas,
                        (p[0].round() as i32, p[1].round() as i32),
                        KEYPOINT_RADIUS,
                        color_of(i),
                    );
                }
            }
        }
    }

    let bgr: Vec<u8> = canvas
        .pixels()
        .flat_map(|Rgb([r, g, b])| [*b, *g, *r])
        .collect();
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        bgr,
    )?)
}

fn draw_axis_box(canvas: &mut RgbImage, [cx, cy, w, h]: [f32; 4], color: Rgb<u8>) {
    let x = (cx - w / 2.0).round() as i32;
    let y = (cy - h / 2.0).round() as i32;
    let (w, h) = (w.round().max(1.0) as u32, h.round().max(1.0) as u32);

    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), color);
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
    }
}

/// Corners of a rotated box, clockwise from the top-left before rotation.
pub fn rotated_corners([cx, cy, w, h, angle]: [f32; 5]) -> [(f32, f32); 4] {
    let (sin, cos) = angle.sin_cos();
    let (hw, hh) = (w / 2.0, h / 2.0);
    [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)]
        .map(|(dx, dy)| (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos))
}

fn draw_polygon_outline(canvas: &mut RgbImage, contour: &Array2<f32>, color: Rgb<u8>) {
    let points: Vec<(f32, f32)> = contour.rows().into_iter().map(|p| (p[0], p[1])).collect();
    if points.len() < 2 {
        return;
    }
    for (i, start) in points.iter().enumerate() {
        let end = points[(i + 1) % points.len()];
        draw_line_segment_mut(canvas, *start, end, color);
    }
}
