use crate::config::Configuration;
use bridge::Publisher;
use inference::{
    ConvertError, DecodedImage, Detector, ImageConverter, InferenceError, NormalizeError,
    PixelEncoding, ResultNormalizer,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use schema::{Detection, DetectionArray, Image};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] ConvertError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Malformed detector output: {0}")]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Processing is disabled; the frame was dropped.
    Skipped,
    Published { detections: usize },
}

struct FrameMetrics {
    duration: Histogram<f64>,
    frames: Counter<u64>,
    dropped: Counter<u64>,
    detections: Counter<u64>,
}

impl FrameMetrics {
    fn init(meter_name: &'static str) -> Self {
        let meter = global::meter(meter_name);
        let latency_buckets = [
            0.005, 0.01, 0.02, 0.03, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 2.0,
        ];
        Self {
            duration: meter
                .f64_histogram("yolo_frame_duration_seconds")
                .with_description("Time to process a single frame (decode + predict + normalize)")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            frames: meter
                .u64_counter("yolo_frames_total")
                .with_description("Total frames published")
                .build(),
            dropped: meter
                .u64_counter("yolo_frames_dropped_total")
                .with_description("Frames dropped while disabled or after a processing error")
                .build(),
            detections: meter
                .u64_counter("yolo_detections_total")
                .with_description("Total detections published")
                .build(),
        }
    }
}

/// Per-image pipeline of a configured node: decode, predict, normalize,
/// publish.
pub struct FrameProcessor {
    enabled: bool,
    converter: ImageConverter,
    normalizer: ResultNormalizer,
    detections: Publisher<DetectionArray>,
    annotated: Option<Publisher<Image>>,
    metrics: FrameMetrics,
}

impl FrameProcessor {
    pub fn new(
        config: &Configuration,
        detections: Publisher<DetectionArray>,
        annotated: Option<Publisher<Image>>,
    ) -> Self {
        Self {
            enabled: config.enable,
            converter: ImageConverter::new(),
            normalizer: ResultNormalizer::new(config.inference.confidence),
            detections,
            annotated,
            metrics: FrameMetrics::init("yolo_node"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn process(
        &mut self,
        image: &Image,
        config: &Configuration,
        detector: &mut dyn Detector,
    ) -> Result<FrameOutcome, FrameError> {
        if !self.enabled {
            return Ok(FrameOutcome::Skipped);
        }

        let _s = tracing::info_span!("process_frame", frame_id = %image.header.frame_id).entered();
        let start = Instant::now();

        let decoded = self.converter.decode(image, config.encoding)?;
        let pre = start.elapsed();

        let raw = {
            let _s = tracing::info_span!("model_inference").entered();
            detector.infer(&decoded, &config.inference)?
        };
        let predict = start.elapsed() - pre;

        let instances = self.normalizer.normalize(&raw, detector.names())?;
        let post = start.elapsed() - pre - predict;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for instance in &instances {
                *counts
                    .entry(instance.hypothesis.class_name.as_str())
                    .or_default() += 1;
            }
            tracing::debug!(
                ?counts,
                width = decoded.width(),
                height = decoded.height(),
                preprocess_ms = pre.as_secs_f64() * 1e3,
                predict_ms = predict.as_secs_f64() * 1e3,
                postprocess_ms = post.as_secs_f64() * 1e3,
                "Frame processed"
            );
        }

        let count = instances.len();
        self.detections.publish(DetectionArray {
            header: image.header.clone(),
            detections: instances.into_iter().map(Detection::from).collect(),
        });

        self.metrics
            .duration
            .record(start.elapsed().as_secs_f64(), &[]);
        self.metrics.frames.add(1, &[]);
        self.metrics.detections.add(count as u64, &[]);

        if let Some(annotated) = &self.annotated {
            // The batch is already out; a rendering failure only costs the overlay.
            match detector.plot(&decoded, &raw) {
                Ok(pixels) => {
                    let plotted = DecodedImage {
                        pixels,
                        encoding: PixelEncoding::Bgr8,
                    };
                    annotated.publish(self.converter.encode(&plotted, image.header.clone()));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        frame_id = %image.header.frame_id,
                        "Failed to render annotated image"
                    );
                }
            }
        }

        Ok(FrameOutcome::Published { detections: count })
    }

    /// Frame callback: never propagates a per-frame failure.
    pub fn handle(&mut self, image: &Image, config: &Configuration, detector: &mut dyn Detector) {
        match self.process(image, config, detector) {
            Ok(FrameOutcome::Published { .. }) => {}
            Ok(FrameOutcome::Skipped) => {
                self.metrics
                    .dropped
                    .add(1, &[KeyValue::new("reason", "disabled")]);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    frame_id = %image.header.frame_id,
                    "Dropping frame"
                );
                self.metrics
                    .dropped
                    .add(1, &[KeyValue::new("reason", "error")]);
            }
        }
    }
}
