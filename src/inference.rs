//! Inference Engine Contract
//!
//! The detection model is an external collaborator. This module defines what
//! the pipeline needs from it:
//! - `InferenceEngine`: run one image through the model with three thresholds
//! - `Detection`: a labeled, confidence-scored region
//! - `Verdict`: the PASS/FAIL classification derived from a detection list
//!
//! Engines are not assumed to be safe for concurrent use; callers go through
//! `InferenceGate` (see `inference_gate.rs`).

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;

// ============================================================================
// Data Models
// ============================================================================

/// Axis-aligned box in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another box
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One region reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    /// Region geometry, when the engine reports one
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// Thresholds handed to the engine on every call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum detection confidence
    pub confidence: f64,
    /// Secondary per-pixel threshold for segmentation masks
    pub pixel_confidence: f64,
    /// Overlap threshold for non-maximum suppression
    pub iou: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.24,
            pixel_confidence: 0.5,
            iou: 0.7,
        }
    }
}

/// PASS/FAIL classification of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Zero detections is PASS, one or more is FAIL.
    pub fn from_detections(detections: &[Detection]) -> Self {
        if detections.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// Suffix used in output file names
    pub fn suffix(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }

    /// Label used for the verdict metric
    pub fn as_label(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

// ============================================================================
// Engine Contract
// ============================================================================

/// A detection model instance.
///
/// Implementations may hold mutable, non-reentrant state (sessions, scratch
/// buffers), which is why `detect` takes `&mut self`. The engine is moved onto
/// a blocking thread for each call, hence `Send + 'static`.
pub trait InferenceEngine: Send + 'static {
    fn detect(
        &mut self,
        image: &DynamicImage,
        thresholds: &Thresholds,
    ) -> anyhow::Result<Vec<Detection>>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn detect(
        &mut self,
        image: &DynamicImage,
        thresholds: &Thresholds,
    ) -> anyhow::Result<Vec<Detection>> {
        (**self).detect(image, thresholds)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Greedy per-label non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.label == candidate.label
                && match (&existing.bbox, &candidate.bbox) {
                    (Some(a), Some(b)) => f64::from(a.iou(b)) > iou_threshold,
                    _ => false,
                }
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

// ============================================================================
// ONNX Runtime Backend
// ============================================================================

#[cfg(feature = "onnx")]
pub mod onnx {
    use super::*;
    use anyhow::{anyhow, Context};
    use image::imageops::FilterType;
    use ndarray::Array4;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};

    /// Number of mask coefficients appended by YOLO segmentation heads
    const SEGMENTATION_MASK_CHANNELS: usize = 32;

    /// YOLO-style detector backed by ONNX Runtime.
    ///
    /// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes (+ 32), N]`
    /// first output. Mask prototypes of segmentation models are not decoded, so
    /// `pixel_confidence` does not affect the result.
    pub struct OnnxDetector {
        session: Session,
        input_name: String,
        input_size: u32,
        labels: Vec<String>,
        model_path: PathBuf,
    }

    impl OnnxDetector {
        pub fn load(model_path: &Path, input_size: u32, labels: Vec<String>) -> anyhow::Result<Self> {
            if !model_path.is_file() {
                return Err(anyhow!("Model not found: {}", model_path.display()));
            }

            let session = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| b.commit_from_file(model_path))
                .map_err(|e| anyhow!("ONNX session creation failed: {}", e))?;

            let input_name = session
                .inputs
                .first()
                .map(|input| input.name.clone())
                .context("Model declares no inputs")?;

            info!(
                model_path = %model_path.display(),
                input = %input_name,
                input_size,
                labels = labels.len(),
                "ONNX detector loaded"
            );

            Ok(Self {
                session,
                input_name,
                input_size,
                labels,
                model_path: model_path.to_path_buf(),
            })
        }

        pub fn model_path(&self) -> &Path {
            &self.model_path
        }

        /// Letterbox into a square canvas and lay out as normalized NCHW.
        fn prepare_input(&self, image: &DynamicImage) -> (Array4<f32>, f32, f32, f32) {
            let size = self.input_size;
            let (width, height) = (image.width().max(1), image.height().max(1));
            let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
            let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
            let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
            let pad_x = (size - new_w) as f32 / 2.0;
            let pad_y = (size - new_h) as f32 / 2.0;

            let resized = image.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();
            let side = size as usize;
            let mut input = Array4::<f32>::from_elem((1, 3, side, side), 114.0 / 255.0);
            let (offset_x, offset_y) = (pad_x as usize, pad_y as usize);

            for (x, y, pixel) in resized.enumerate_pixels() {
                let (px, py) = (x as usize + offset_x, y as usize + offset_y);
                for channel in 0..3 {
                    input[[0, channel, py, px]] = f32::from(pixel[channel]) / 255.0;
                }
            }

            (input, scale, pad_x, pad_y)
        }
    }

    impl InferenceEngine for OnnxDetector {
        fn detect(
            &mut self,
            image: &DynamicImage,
            thresholds: &Thresholds,
        ) -> anyhow::Result<Vec<Detection>> {
            let (input, scale, pad_x, pad_y) = self.prepare_input(image);
            let tensor = Tensor::from_array(input)
                .map_err(|e| anyhow!("Failed to create input tensor: {}", e))?;

            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => tensor])
                .map_err(|e| anyhow!("ONNX inference failed: {}", e))?;

            let (_, output) = outputs
                .iter()
                .next()
                .context("Model produced no outputs")?;
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("Failed to read output tensor: {}", e))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

            let (channels, anchors) = match dims.as_slice() {
                [1, c, n] => (*c, *n),
                other => return Err(anyhow!("Unexpected output shape {:?}", other)),
            };

            let mut classes = channels.saturating_sub(4);
            if outputs.len() > 1 && classes > SEGMENTATION_MASK_CHANNELS {
                classes -= SEGMENTATION_MASK_CHANNELS;
            }
            if classes == 0 {
                return Err(anyhow!("Output has no class channels: {:?}", dims));
            }

            let mut candidates = Vec::new();
            for anchor in 0..anchors {
                let at = |channel: usize| data[channel * anchors + anchor];

                let (class_id, score) = (0..classes)
                    .map(|c| (c, at(4 + c)))
                    .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
                if f64::from(score) < thresholds.confidence {
                    continue;
                }

                let (cx, cy, w, h) = (at(0), at(1), at(2), at(3));
                let bbox = BoundingBox {
                    x: ((cx - w / 2.0 - pad_x) / scale).max(0.0),
                    y: ((cy - h / 2.0 - pad_y) / scale).max(0.0),
                    width: w / scale,
                    height: h / scale,
                };
                candidates.push(Detection::new(label_for(&self.labels, class_id), f64::from(score)).with_bbox(bbox));
            }

            let detections = non_max_suppression(candidates, thresholds.iou);
            debug!(detections = detections.len(), "ONNX detection finished");
            Ok(detections)
        }
    }

    fn label_for(labels: &[String], class_id: usize) -> String {
        labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

// ============================================================================
// Tests
// ============================================================================
