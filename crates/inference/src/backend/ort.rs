//! ONNX Runtime detector for exported YOLO models.
//!
//! Class names, task and keypoint shape come from the metadata Ultralytics
//! embeds in the export. The `output0` channel count must match that task:
//! `4 + nc` detect, `4 + nc + 1` oriented, `4 + nc + k * d` pose, and a
//! second `output1` prototype tensor marks a segmentation model. Exports
//! without a task entry fall back to guessing the head from the channel count.

use super::{
    Capabilities, Detector, DetectorLoader, InferenceError, InferenceParams, ModelSpec, ModelType,
};
use crate::labels;
use crate::processing::letterbox::{Letterbox, LetterboxPreprocessor};
use crate::processing::pre::{DecodedImage, PixelEncoding};
use crate::processing::render::rotated_corners;
use crate::result::{Boxes, KeypointInstance, Keypoints, Masks, OrientedBoxes, RawResult};
use anyhow::Context;
use common::span;
use image::{GrayImage, ImageBuffer, Luma, imageops};
use imageproc::contours::{BorderType, find_contours};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix3, Ix4};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use std::path::{Path, PathBuf};

const BACKEND: &str = "onnxruntime";
const MASK_THRESHOLD: f32 = 0.5;
const INTRA_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Cuda { device_id: i32 },
}

impl ExecutionProvider {
    /// `cpu`, `cuda`, `cuda:N` or a bare GPU index.
    pub fn from_device(device: &str) -> Result<Self, InferenceError> {
        let device = device.trim().to_ascii_lowercase();
        if device.is_empty() || device == "cpu" {
            return Ok(ExecutionProvider::Cpu);
        }
        let index = device.strip_prefix("cuda").map(|rest| rest.trim_start_matches(':'));
        let index = match index {
            Some("") => return Ok(ExecutionProvider::Cuda { device_id: 0 }),
            Some(rest) => rest,
            None => device.as_str(),
        };
        index
            .parse()
            .map(|device_id| ExecutionProvider::Cuda { device_id })
            .map_err(|_| anyhow::anyhow!("Unrecognized device '{}'", device).into())
    }
}

/// Task recorded in the export metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Detect,
    Segment,
    Pose,
    Obb,
}

impl Task {
    fn parse(task: &str) -> Option<Self> {
        match task.trim() {
            "detect" => Some(Task::Detect),
            "segment" => Some(Task::Segment),
            "pose" => Some(Task::Pose),
            "obb" => Some(Task::Obb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ExportMetadata {
    names: Option<Vec<String>>,
    task: Option<Task>,
    /// `(keypoints, values per keypoint)`
    kpt_shape: Option<(usize, usize)>,
}

impl ExportMetadata {
    /// Missing or malformed entries are left empty.
    fn read(session: &Session) -> Self {
        let metadata = match session.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "Model metadata unavailable");
                return Self::default();
            }
        };
        let entry = |key: &str| metadata.custom(key);

        let names = entry("names").and_then(|raw| match labels::parse_model_names(&raw) {
            Ok(names) => Some(names),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring model class names");
                None
            }
        });
        let task = entry("task").and_then(|raw| {
            let task = Task::parse(&raw);
            if task.is_none() {
                tracing::warn!(task = %raw, "Unknown model task, guessing head from output shape");
            }
            task
        });
        let kpt_shape = entry("kpt_shape").and_then(|raw| match parse_kpt_shape(&raw) {
            Ok(shape) => Some(shape),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring keypoint shape");
                None
            }
        });

        Self {
            names,
            task,
            kpt_shape,
        }
    }
}

/// `[17, 3]` as written by the exporter.
fn parse_kpt_shape(raw: &str) -> anyhow::Result<(usize, usize)> {
    let dims = raw
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Malformed keypoint shape {}", raw))?;
    match dims.as_slice() {
        [keypoints, values @ (2 | 3)] => Ok((*keypoints, *values)),
        _ => anyhow::bail!("Unsupported keypoint shape {}", raw),
    }
}

pub struct OrtLoader {
    labels_path: Option<PathBuf>,
}

impl OrtLoader {
    /// `labels_path` overrides the class names stored in the model.
    pub fn new(labels_path: Option<PathBuf>) -> Self {
        Self { labels_path }
    }

    fn labels(&self, embedded: Option<Vec<String>>) -> Result<Vec<String>, InferenceError> {
        match (&self.labels_path, embedded) {
            (Some(path), _) => Ok(labels::load_labels(path)?),
            (None, Some(names)) => Ok(names),
            (None, None) => {
                tracing::warn!("Model carries no class names, using COCO labels");
                Ok(labels::coco_labels())
            }
        }
    }
}

impl DetectorLoader for OrtLoader {
    fn load(&self, spec: &ModelSpec<'_>) -> Result<Box<dyn Detector>, InferenceError> {
        if spec.model_type == ModelType::World {
            return Err(InferenceError::UnsupportedModelType {
                model_type: spec.model_type,
                backend: BACKEND,
            });
        }

        let path = Path::new(spec.model);
        if !path.is_file() {
            return Err(InferenceError::ModelNotFound(spec.model.to_string()));
        }

        let provider = ExecutionProvider::from_device(spec.device)?;
        let session = build_session(path, provider)?;
        let metadata = ExportMetadata::read(&session);
        let names = self.labels(metadata.names)?;

        tracing::info!(
            model = %path.display(),
            ?provider,
            task = ?metadata.task,
            kpt_shape = ?metadata.kpt_shape,
            classes = names.len(),
            "Model loaded"
        );

        Ok(Box::new(OrtDetector {
            session,
            names,
            task: metadata.task,
            kpt_shape: metadata.kpt_shape,
            preprocessor: LetterboxPreprocessor::new(),
            warned_unsupported: false,
        }))
    }
}

fn build_session(path: &Path, provider: ExecutionProvider) -> anyhow::Result<Session> {
    // Idempotent
    let _ = ort::init().commit();

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(INTRA_THREADS)?;

    match provider {
        ExecutionProvider::Cuda { device_id } => {
            tracing::info!(device_id, "Initializing ONNX Runtime with CUDA execution provider");
            builder = builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure(),
            ])?;
        }
        ExecutionProvider::Cpu => {
            tracing::info!("Initializing ONNX Runtime with CPU execution provider");
        }
    }

    builder
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model {}", path.display()))
}

pub struct OrtDetector {
    session: Session,
    names: Vec<String>,
    task: Option<Task>,
    kpt_shape: Option<(usize, usize)>,
    preprocessor: LetterboxPreprocessor,
    warned_unsupported: bool,
}

impl OrtDetector {
    /// Returns `output0` and, for segmentation models, the `output1` prototypes.
    fn run_session(
        &mut self,
        input: &ArrayD<f32>,
    ) -> anyhow::Result<(ArrayD<f32>, Option<ArrayD<f32>>)> {
        let _s = span!("model_run");

        let outputs = self.session.run(ort::inputs![
            "images" => TensorRef::from_array_view(input.view())?
        ])?;

        let output0: ArrayD<f32> = outputs["output0"].try_extract_array()?.into_owned();
        let protos = match outputs.get("output1") {
            Some(value) => Some(value.try_extract_array::<f32>()?.into_owned()),
            None => None,
        };
        Ok((output0, protos))
    }
}

impl Detector for OrtDetector {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            open_vocabulary: false,
        }
    }

    fn fuse(&mut self) -> Result<(), InferenceError> {
        tracing::debug!("Graph already fused by ONNX Runtime optimization level 3");
        Ok(())
    }

    fn infer(
        &mut self,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<RawResult, InferenceError> {
        if (params.augment || params.half) && !self.warned_unsupported {
            tracing::warn!(
                augment = params.augment,
                half = params.half,
                "Test-time augmentation and half precision are fixed at export time, ignoring"
            );
            self.warned_unsupported = true;
        }

        let (width, height) = (image.width(), image.height());
        let rgb = image.to_packed(PixelEncoding::Rgb8);
        let (input, letterbox) = self
            .preprocessor
            .run(&rgb, width, height, params.image_size)?;

        let (output0, protos) = self.run_session(&input)?;

        let decoder = HeadDecoder {
            num_classes: self.names.len(),
            task: self.task,
            kpt_shape: self.kpt_shape,
            letterbox,
            input_size: params.image_size,
            orig_shape: (height, width),
        };
        decoder.decode(output0, protos, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Head {
    Detect,
    Oriented,
    /// `dims` is 3 when each keypoint carries a visibility score.
    Pose { keypoints: usize, dims: usize },
    Segment { coefficients: usize },
}

#[derive(Debug, Clone)]
struct Candidate {
    anchor: usize,
    class_id: u32,
    score: f32,
    xywh: [f32; 4],
    angle: f32,
}

impl Candidate {
    /// Axis-aligned extent `[x1, y1, x2, y2]`; rotated boxes use their hull.
    fn extent(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.xywh;
        if self.angle == 0.0 {
            return [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0];
        }
        let corners = rotated_corners([cx, cy, w, h, self.angle]);
        corners.iter().fold(
            [f32::MAX, f32::MAX, f32::MIN, f32::MIN],
            |[x1, y1, x2, y2], &(x, y)| [x1.min(x), y1.min(y), x2.max(x), y2.max(y)],
        )
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy NMS over score-sorted candidates, class-aware unless `agnostic`.
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    agnostic: bool,
    max_det: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let extents: Vec<[f32; 4]> = candidates.iter().map(Candidate::extent).collect();

    let mut kept: Vec<usize> = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        if kept.len() >= max_det {
            break;
        }
        let suppressed = kept.iter().any(|&k| {
            (agnostic || candidates[k].class_id == candidate.class_id)
                && iou(&extents[k], &extents[i]) > iou_threshold
        });
        if !suppressed {
            kept.push(i);
        }
    }

    kept.into_iter().map(|i| candidates[i].clone()).collect()
}

struct HeadDecoder {
    num_classes: usize,
    task: Option<Task>,
    kpt_shape: Option<(usize, usize)>,
    letterbox: Letterbox,
    /// `(height, width)`
    input_size: (u32, u32),
    /// `(height, width)`
    orig_shape: (u32, u32),
}

impl HeadDecoder {
    fn head(&self, channels: usize, protos: Option<&ArrayD<f32>>) -> Result<Head, InferenceError> {
        let nc = self.num_classes;
        if channels < 4 + nc {
            return Err(InferenceError::InvalidOutput(format!(
                "{} channels cannot hold 4 box values and {} class scores",
                channels, nc
            )));
        }
        let extra = channels - 4 - nc;
        match self.task {
            Some(task) => self.head_for_task(task, extra, protos.is_some()),
            None => Self::guess_head(extra, protos.is_some()),
        }
    }

    fn head_for_task(&self, task: Task, extra: usize, has_protos: bool) -> Result<Head, InferenceError> {
        match task {
            Task::Detect if extra == 0 => Ok(Head::Detect),
            Task::Obb if extra == 1 => Ok(Head::Oriented),
            Task::Segment if has_protos && extra > 0 => Ok(Head::Segment { coefficients: extra }),
            Task::Pose => {
                let (keypoints, dims) = self.kpt_shape.unwrap_or((extra / 3, 3));
                if keypoints > 0 && keypoints * dims == extra {
                    Ok(Head::Pose { keypoints, dims })
                } else {
                    Err(InferenceError::InvalidOutput(format!(
                        "{} extra channels do not hold {} keypoints of {} values",
                        extra, keypoints, dims
                    )))
                }
            }
            _ => Err(InferenceError::InvalidOutput(format!(
                "{} extra channels do not fit a {:?} head",
                extra, task
            ))),
        }
    }

    /// Head from channel count alone, for exports without a task entry.
    fn guess_head(extra: usize, has_protos: bool) -> Result<Head, InferenceError> {
        match (has_protos, extra) {
            (true, 0) => Err(InferenceError::InvalidOutput(
                "prototype masks without mask coefficients".to_string(),
            )),
            (true, coefficients) => Ok(Head::Segment { coefficients }),
            (false, 0) => Ok(Head::Detect),
            (false, 1) => Ok(Head::Oriented),
            (false, n) if n % 3 == 0 => Ok(Head::Pose {
                keypoints: n / 3,
                dims: 3,
            }),
            (false, n) => Err(InferenceError::InvalidOutput(format!(
                "{} extra channels match no known head",
                n
            ))),
        }
    }

    fn decode(
        &self,
        output0: ArrayD<f32>,
        protos: Option<ArrayD<f32>>,
        params: &InferenceParams,
    ) -> Result<RawResult, InferenceError> {
        let _s = span!("decode");

        let output = output0
            .into_dimensionality::<Ix3>()
            .map_err(|e| InferenceError::InvalidOutput(format!("output0: {}", e)))?;
        let preds = output.index_axis(Axis(0), 0);
        let (channels, anchors) = preds.dim();
        let head = self.head(channels, protos.as_ref())?;
        let nc = self.num_classes;

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let column = preds.column(anchor);
            let (class_id, score) = column
                .iter()
                .skip(4)
                .take(nc)
                .enumerate()
                .fold((0usize, f32::MIN), |best, (c, &s)| if s > best.1 { (c, s) } else { best });
            if score < params.confidence {
                continue;
            }
            candidates.push(Candidate {
                anchor,
                class_id: class_id as u32,
                score,
                xywh: [column[0], column[1], column[2], column[3]],
                angle: if head == Head::Oriented { column[4 + nc] } else { 0.0 },
            });
        }

        let kept = non_max_suppression(candidates, params.iou, params.agnostic_nms, params.max_det);
        tracing::trace!(?head, anchors, kept = kept.len(), "Decoded model output");

        let mut result = RawResult::empty(self.orig_shape);
        let n = kept.len();
        let cls = Array1::from_iter(kept.iter().map(|c| c.class_id));
        let conf = Array1::from_iter(kept.iter().map(|c| c.score));

        if head == Head::Oriented {
            let mut xywhr = Array2::zeros((n, 5));
            for (i, c) in kept.iter().enumerate() {
                let [cx, cy, w, h] = self.box_to_source(c.xywh);
                xywhr.row_mut(i).assign(&Array1::from(vec![cx, cy, w, h, c.angle]));
            }
            result.obb = Some(OrientedBoxes { xywhr, cls, conf });
            return Ok(result);
        }

        let mut xywh = Array2::zeros((n, 4));
        for (i, c) in kept.iter().enumerate() {
            xywh.row_mut(i).assign(&Array1::from(self.box_to_source(c.xywh).to_vec()));
        }
        result.boxes = Some(Boxes { xywh, cls, conf });

        match head {
            Head::Pose { keypoints, dims } => {
                let instances = kept
                    .iter()
                    .map(|c| self.keypoints(&preds.column(c.anchor).to_vec(), keypoints, dims))
                    .collect();
                result.keypoints = Some(Keypoints { instances });
            }
            Head::Segment { coefficients } => {
                if let Some(protos) = protos {
                    let protos = protos
                        .into_dimensionality::<Ix4>()
                        .map_err(|e| InferenceError::InvalidOutput(format!("output1: {}", e)))?;
                    let protos = protos.index_axis(Axis(0), 0).to_owned();
                    let contours = kept
                        .iter()
                        .map(|c| {
                            let column = preds.column(c.anchor);
                            let coeffs: Vec<f32> =
                                column.iter().skip(4 + nc).take(coefficients).copied().collect();
                            self.mask_contours(&protos, &coeffs, c.xywh, params.retina_masks)
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    result.masks = Some(Masks { contours });
                }
            }
            Head::Detect | Head::Oriented => {}
        }

        Ok(result)
    }

    fn box_to_source(&self, [cx, cy, w, h]: [f32; 4]) -> [f32; 4] {
        let (x, y) = self.letterbox.to_source(cx, cy);
        [
            x,
            y,
            self.letterbox.length_to_source(w),
            self.letterbox.length_to_source(h),
        ]
    }

    /// Two-value keypoints carry no score, so the instance has no confidence.
    fn keypoints(&self, column: &[f32], count: usize, dims: usize) -> KeypointInstance {
        let offset = 4 + self.num_classes;
        let mut xy = Array2::zeros((count, 2));
        let mut conf = Array1::zeros(count);
        for k in 0..count {
            let base = offset + k * dims;
            let (x, y) = self.letterbox.to_source(column[base], column[base + 1]);
            xy[[k, 0]] = x;
            xy[[k, 1]] = y;
            if dims == 3 {
                conf[k] = column[base + 2];
            }
        }
        KeypointInstance {
            xy,
            conf: (dims == 3).then_some(conf),
        }
    }

    /// Outline of one instance mask in source pixels, largest contour first.
    fn mask_contours(
        &self,
        protos: &ndarray::Array3<f32>,
        coeffs: &[f32],
        xywh: [f32; 4],
        retina: bool,
    ) -> Result<Vec<Array2<f32>>, InferenceError> {
        let (nm, mh, mw) = protos.dim();
        if coeffs.len() != nm {
            return Err(InferenceError::InvalidOutput(format!(
                "{} mask coefficients for {} prototypes",
                coeffs.len(),
                nm
            )));
        }

        let (in_h, in_w) = self.input_size;
        let (sx, sy) = (mw as f32 / in_w as f32, mh as f32 / in_h as f32);
        let [cx, cy, w, h] = xywh;
        let (x1, y1) = ((cx - w / 2.0) * sx, (cy - h / 2.0) * sy);
        let (x2, y2) = ((cx + w / 2.0) * sx, (cy + h / 2.0) * sy);

        let coeffs = Array1::from(coeffs.to_vec());
        let flat = protos
            .to_shape((nm, mh * mw))
            .map_err(|e| InferenceError::InvalidOutput(format!("prototypes: {}", e)))?;
        let logits = coeffs.dot(&flat);

        let prob: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(mw as u32, mh as u32, |x, y| {
                let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
                let inside = fx >= x1 && fx <= x2 && fy >= y1 && fy <= y2;
                let v = logits[y as usize * mw + x as usize];
                Luma([if inside { sigmoid(v) } else { 0.0 }])
            });

        // Retina masks trace the outline at network resolution instead of prototype resolution.
        let (prob, px_scale) = if retina {
            let up = imageops::resize(&prob, in_w, in_h, imageops::FilterType::Triangle);
            (up, (1.0, 1.0))
        } else {
            (prob, (1.0 / sx, 1.0 / sy))
        };

        let binary: GrayImage = ImageBuffer::from_fn(prob.width(), prob.height(), |x, y| {
            Luma([if prob.get_pixel(x, y)[0] > MASK_THRESHOLD { 255 } else { 0 }])
        });

        let mut outer: Vec<Vec<(f32, f32)>> = find_contours::<i32>(&binary)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .map(|c| {
                c.points
                    .iter()
                    .map(|p| {
                        self.letterbox
                            .to_source(p.x as f32 * px_scale.0, p.y as f32 * px_scale.1)
                    })
                    .collect()
            })
            .collect();
        outer.sort_by_key(|points| std::cmp::Reverse(points.len()));

        outer
            .into_iter()
            .map(|points| {
                let n = points.len();
                Array2::from_shape_vec((n, 2), points.into_iter().flat_map(|(x, y)| [x, y]).collect())
                    .map_err(|e| InferenceError::InvalidOutput(format!("contour: {}", e)))
            })
            .collect()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
