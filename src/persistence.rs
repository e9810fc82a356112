//! Result persistence.
//!
//! Layout: `<output_root>/<work item>/<station>/<stem>_<PASS|FAIL><ext>`, plus
//! an optional JSON sidecar next to it with the same stem.

use crate::error::{MonitorError, Result};
use crate::inference::{BoundingBox, Detection, Thresholds, Verdict};
use crate::queue::display_name;
use crate::retry::{io_failure, retry_with_linear_backoff};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const JPEG_QUALITY: u8 = 80;
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 100;
const BOX_THICKNESS: u32 = 2;
const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Mode label written into sidecars produced by the monitor
pub const MONITOR_MODE: &str = "MonitorMode";

/// Sidecar record. Key names are kept compatible with existing consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectionRecord {
    pub mode: String,
    pub confidence: f64,
    pub pixel_confidence: f64,
    #[serde(rename = "IoU")]
    pub iou: f64,
    pub detection_count: usize,
    pub detections: Vec<DetectionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectionEntry {
    pub label: String,
    pub confidence: f64,
}

impl DetectionRecord {
    pub fn new(mode: &str, thresholds: &Thresholds, detections: &[Detection]) -> Self {
        Self {
            mode: mode.to_string(),
            confidence: thresholds.confidence,
            pixel_confidence: thresholds.pixel_confidence,
            iou: thresholds.iou,
            detection_count: detections.len(),
            detections: detections
                .iter()
                .map(|d| DetectionEntry {
                    label: d.label.clone(),
                    confidence: d.confidence,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedResult {
    pub output_path: PathBuf,
    /// Present only when sidecars are enabled and the write succeeded
    pub sidecar_path: Option<PathBuf>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct ResultPersistence {
    output_root: PathBuf,
    generate_sidecar: bool,
}

impl ResultPersistence {
    pub fn new(output_root: impl Into<PathBuf>, generate_sidecar: bool) -> Self {
        Self {
            output_root: output_root.into(),
            generate_sidecar,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Where the annotated copy of `source` goes.
    pub fn output_path_for(&self, work_item: &str, source: &Path, verdict: Verdict) -> PathBuf {
        let station = source.parent().map(display_name).unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = match source.extension() {
            Some(ext) => format!("{}_{}.{}", stem, verdict.suffix(), ext.to_string_lossy()),
            None => format!("{}_{}", stem, verdict.suffix()),
        };

        self.output_root.join(work_item).join(station).join(file_name)
    }

    /// Annotate, encode and write one classified image.
    ///
    /// A failing sidecar write is logged and does not fail the image.
    pub async fn persist(
        &self,
        work_item: &str,
        source: &Path,
        image: DynamicImage,
        detections: &[Detection],
        thresholds: &Thresholds,
    ) -> Result<PersistedResult> {
        let verdict = Verdict::from_detections(detections);
        let output_path = self.output_path_for(work_item, source, verdict);
        let persistence_error = |reason: String| MonitorError::Persistence {
            path: output_path.clone(),
            reason,
        };

        if let Some(dir) = output_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| persistence_error(format!("create directory: {}", e)))?;
        }

        let format = output_format(&output_path)
            .ok_or_else(|| persistence_error("unsupported output extension".to_string()))?;
        let boxes: Vec<BoundingBox> = detections.iter().filter_map(|d| d.bbox).collect();
        let encoded = tokio::task::spawn_blocking(move || encode(image, &boxes, format))
            .await?
            .map_err(|e| persistence_error(format!("encode: {}", e)))?;

        write_with_retry(&output_path, Arc::from(encoded))
            .await
            .map_err(|e| persistence_error(e.to_string()))?;
        debug!(output = %output_path.display(), %verdict, "Result image written");

        let sidecar_path = if self.generate_sidecar {
            self.write_sidecar(&output_path, thresholds, detections).await
        } else {
            None
        };

        Ok(PersistedResult {
            output_path,
            sidecar_path,
            verdict,
        })
    }

    async fn write_sidecar(
        &self,
        output_path: &Path,
        thresholds: &Thresholds,
        detections: &[Detection],
    ) -> Option<PathBuf> {
        let sidecar_path = output_path.with_extension("json");
        let record = DetectionRecord::new(MONITOR_MODE, thresholds, detections);

        let bytes = match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %sidecar_path.display(), error = %e, "Failed to serialize sidecar");
                return None;
            }
        };

        match write_with_retry(&sidecar_path, Arc::from(bytes)).await {
            Ok(()) => Some(sidecar_path),
            Err(e) => {
                warn!(path = %sidecar_path.display(), error = %e, "Failed to write sidecar");
                None
            }
        }
    }
}

fn output_format(path: &Path) -> Option<ImageFormat> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ImageFormat::from_extension(&ext)? {
        format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp | ImageFormat::Gif) => {
            Some(format)
        }
        _ => None,
    }
}

fn encode(image: DynamicImage, boxes: &[BoundingBox], format: ImageFormat) -> image::ImageResult<Vec<u8>> {
    let mut canvas = image.into_rgba8();
    for bbox in boxes {
        draw_box(&mut canvas, bbox);
    }

    let mut buffer = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY))?;
        }
        other => DynamicImage::ImageRgba8(canvas).write_to(&mut buffer, other)?,
    }
    Ok(buffer.into_inner())
}

/// Outline `bbox` on `canvas`, clipped to the image bounds.
fn draw_box(canvas: &mut RgbaImage, bbox: &BoundingBox) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let clamp = |v: f32, max: u32| -> u32 { (v.max(0.0) as u32).min(max - 1) };
    let x0 = clamp(bbox.x, width);
    let y0 = clamp(bbox.y, height);
    let x1 = clamp(bbox.x + bbox.width, width);
    let y1 = clamp(bbox.y + bbox.height, height);

    for t in 0..BOX_THICKNESS {
        let top = (y0 + t).min(y1);
        let bottom = y1.saturating_sub(t).max(y0);
        let left = (x0 + t).min(x1);
        let right = x1.saturating_sub(t).max(x0);

        for x in x0..=x1 {
            canvas.put_pixel(x, top, BOX_COLOR);
            canvas.put_pixel(x, bottom, BOX_COLOR);
        }
        for y in y0..=y1 {
            canvas.put_pixel(left, y, BOX_COLOR);
            canvas.put_pixel(right, y, BOX_COLOR);
        }
    }
}

async fn write_with_retry(path: &Path, bytes: Arc<[u8]>) -> Result<()> {
    retry_with_linear_backoff(
        || {
            let bytes = bytes.clone();
            async move { tokio::fs::write(path, &bytes[..]).await.map_err(io_failure) }
        },
        WRITE_ATTEMPTS,
        WRITE_RETRY_DELAY_MS,
    )
    .await
}
