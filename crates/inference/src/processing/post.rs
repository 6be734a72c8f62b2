//! Normalization of raw detector output into per-instance detections.
//!
//! A raw result carries up to four parallel arrays. Hypotheses and boxes
//! always come from the same source (axis-aligned boxes when present,
//! oriented boxes otherwise); masks and keypoints are optional extras that
//! are paired back to their instance by index.

use crate::result::{Boxes, OrientedBoxes, RawResult};
use common::span_debug;
use schema::{BoundingBox2D, Detection, KeyPoint2D, KeyPoint2DArray, Mask, Point2D, Vector2};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("{field} has {actual} entries, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} rows have {actual} columns, expected at least {expected}")]
    MalformedArray {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Class id {class_id} is outside the label table ({table_len} names)")]
    UnknownClass { class_id: u32, table_len: usize },

    #[error("Keypoints reference instance {instance} but only {count} instances exist")]
    KeypointInstanceOutOfRange { instance: usize, count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub class_id: u32,
    pub class_name: String,
    pub score: f32,
}

/// Keypoints that survived filtering, tagged with the instance they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceKeypoints {
    pub instance: usize,
    pub keypoints: KeyPoint2DArray,
}

/// One detected object with everything the model reported about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub hypothesis: Hypothesis,
    pub bbox: BoundingBox2D,
    pub mask: Option<Mask>,
    pub keypoints: Option<KeyPoint2DArray>,
}

impl From<Instance> for Detection {
    fn from(instance: Instance) -> Self {
        Detection {
            class_id: instance.hypothesis.class_id as i32,
            class_name: instance.hypothesis.class_name,
            score: instance.hypothesis.score as f64,
            bbox: instance.bbox,
            mask: instance.mask,
            keypoints: instance.keypoints,
        }
    }
}

enum BoxSource<'a> {
    Axis(&'a Boxes),
    Oriented(&'a OrientedBoxes),
    Empty,
}

/// Single branch decision shared by hypothesis and box parsing.
fn box_source(raw: &RawResult) -> BoxSource<'_> {
    if let Some(boxes) = raw.boxes.as_ref().filter(|b| !b.is_empty()) {
        BoxSource::Axis(boxes)
    } else if let Some(obb) = raw.obb.as_ref().filter(|o| !o.is_empty()) {
        BoxSource::Oriented(obb)
    } else {
        BoxSource::Empty
    }
}

fn check_len(field: &'static str, expected: usize, actual: usize) -> Result<(), NormalizeError> {
    if expected != actual {
        return Err(NormalizeError::LengthMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_columns(field: &'static str, expected: usize, actual: usize) -> Result<(), NormalizeError> {
    if actual < expected {
        return Err(NormalizeError::MalformedArray {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResultNormalizer {
    keypoint_threshold: f32,
}

impl ResultNormalizer {
    pub fn new(keypoint_threshold: f32) -> Self {
        Self { keypoint_threshold }
    }

    pub fn parse_hypotheses(
        &self,
        raw: &RawResult,
        names: &[String],
    ) -> Result<Vec<Hypothesis>, NormalizeError> {
        let (cls, conf, field) = match box_source(raw) {
            BoxSource::Axis(boxes) => (&boxes.cls, &boxes.conf, "boxes"),
            BoxSource::Oriented(obb) => (&obb.cls, &obb.conf, "obb"),
            BoxSource::Empty => return Ok(Vec::new()),
        };
        check_len(field, cls.len(), conf.len())?;

        cls.iter()
            .zip(conf.iter())
            .map(|(&class_id, &score)| {
                let class_name = names.get(class_id as usize).ok_or(NormalizeError::UnknownClass {
                    class_id,
                    table_len: names.len(),
                })?;
                Ok(Hypothesis {
                    class_id,
                    class_name: class_name.clone(),
                    score,
                })
            })
            .collect()
    }

    pub fn parse_boxes(&self, raw: &RawResult) -> Result<Vec<BoundingBox2D>, NormalizeError> {
        match box_source(raw) {
            BoxSource::Axis(boxes) => {
                check_columns("boxes", 4, boxes.xywh.ncols())?;
                Ok(boxes
                    .xywh
                    .rows()
                    .into_iter()
                    .map(|row| BoundingBox2D::AxisAligned {
                        center: Point2D::new(row[0] as f64, row[1] as f64),
                        size: Vector2 {
                            x: row[2] as f64,
                            y: row[3] as f64,
                        },
                    })
                    .collect())
            }
            BoxSource::Oriented(obb) => {
                check_columns("obb", 5, obb.xywhr.ncols())?;
                Ok(obb
                    .xywhr
                    .rows()
                    .into_iter()
                    .map(|row| BoundingBox2D::Oriented {
                        center: Point2D::new(row[0] as f64, row[1] as f64),
                        size: Vector2 {
                            x: row[2] as f64,
                            y: row[3] as f64,
                        },
                        theta: row[4] as f64,
                    })
                    .collect())
            }
            BoxSource::Empty => Ok(Vec::new()),
        }
    }

    /// First contour of each instance, sized to the source image.
    pub fn parse_masks(&self, raw: &RawResult) -> Result<Vec<Mask>, NormalizeError> {
        let Some(masks) = &raw.masks else {
            return Ok(Vec::new());
        };
        let (height, width) = raw.orig_shape;

        masks
            .contours
            .iter()
            .map(|contours| {
                let data = match contours.first() {
                    Some(contour) => {
                        check_columns("masks", 2, contour.ncols())?;
                        contour
                            .rows()
                            .into_iter()
                            .map(|p| Point2D::new(p[0] as f64, p[1] as f64))
                            .collect()
                    }
                    None => Vec::new(),
                };
                Ok(Mask {
                    height,
                    width,
                    data,
                })
            })
            .collect()
    }

    /// Keypoints at or above the threshold, numbered from 1 per instance.
    /// Instances without confidence data produce no set.
    pub fn parse_keypoints(
        &self,
        raw: &RawResult,
    ) -> Result<Vec<InstanceKeypoints>, NormalizeError> {
        let Some(keypoints) = &raw.keypoints else {
            return Ok(Vec::new());
        };

        let mut sets = Vec::with_capacity(keypoints.len());
        for (instance, kp) in keypoints.instances.iter().enumerate() {
            let Some(conf) = &kp.conf else {
                continue;
            };
            check_columns("keypoints", 2, kp.xy.ncols())?;
            check_len("keypoint scores", kp.xy.nrows(), conf.len())?;

            let data = kp
                .xy
                .rows()
                .into_iter()
                .zip(conf.iter())
                .filter(|(_, score)| **score >= self.keypoint_threshold)
                .enumerate()
                .map(|(i, (p, &score))| KeyPoint2D {
                    id: i as i32 + 1,
                    point: Point2D::new(p[0] as f64, p[1] as f64),
                    score: score as f64,
                })
                .collect();

            sets.push(InstanceKeypoints {
                instance,
                keypoints: KeyPoint2DArray { data },
            });
        }
        Ok(sets)
    }

    /// Pair per-instance outputs by index. Hypotheses, boxes and (when
    /// present) masks must all have exactly `count` entries.
    pub fn assemble(
        &self,
        count: usize,
        hypotheses: Vec<Hypothesis>,
        boxes: Vec<BoundingBox2D>,
        masks: Option<Vec<Mask>>,
        keypoints: Vec<InstanceKeypoints>,
    ) -> Result<Vec<Instance>, NormalizeError> {
        check_len("hypotheses", count, hypotheses.len())?;
        check_len("boxes", count, boxes.len())?;

        let masks: Vec<Option<Mask>> = match masks {
            Some(masks) => {
                check_len("masks", count, masks.len())?;
                masks.into_iter().map(Some).collect()
            }
            None => vec![None; count],
        };

        let mut paired: Vec<Option<KeyPoint2DArray>> = vec![None; count];
        for set in keypoints {
            let slot = paired
                .get_mut(set.instance)
                .ok_or(NormalizeError::KeypointInstanceOutOfRange {
                    instance: set.instance,
                    count,
                })?;
            *slot = Some(set.keypoints);
        }

        Ok(hypotheses
            .into_iter()
            .zip(boxes)
            .zip(masks)
            .zip(paired)
            .map(|(((hypothesis, bbox), mask), keypoints)| Instance {
                hypothesis,
                bbox,
                mask,
                keypoints,
            })
            .collect())
    }

    pub fn normalize(
        &self,
        raw: &RawResult,
        names: &[String],
    ) -> Result<Vec<Instance>, NormalizeError> {
        let _s = span_debug!("normalize");
        let hypotheses = self.parse_hypotheses(raw, names)?;
        let boxes = self.parse_boxes(raw)?;
        let masks = match &raw.masks {
            Some(m) if !m.is_empty() => Some(self.parse_masks(raw)?),
            _ => None,
        };
        let keypoints = self.parse_keypoints(raw)?;

        self.assemble(hypotheses.len(), hypotheses, boxes, masks, keypoints)
    }
}

impl Default for ResultNormalizer {
    fn default() -> Self {
        Self::new(0.5)
    }
}
