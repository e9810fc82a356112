//! Shared fixtures for integration tests

#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use station_monitor::{BoundingBox, Detection, InferenceEngine, Thresholds};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFECT: Rgb<u8> = Rgb([255, 0, 0]);
const CLEAN: Rgb<u8> = Rgb([128, 128, 128]);

/// Reports one defect when the top-left pixel is red.
#[derive(Clone, Default)]
pub struct MarkerEngine {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl MarkerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for MarkerEngine {
    fn detect(&mut self, image: &DynamicImage, _thresholds: &Thresholds) -> anyhow::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let pixel = *image.to_rgb8().get_pixel(0, 0);
        if pixel == DEFECT {
            Ok(vec![Detection::new("defect", 0.93).with_bbox(BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 3.0,
                height: 3.0,
            })])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Write a small lossless image; `defect` images produce one detection.
pub fn write_image(path: &Path, defect: bool) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let color = if defect { DEFECT } else { CLEAN };
    RgbImage::from_pixel(8, 8, color).save(path).unwrap();
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
