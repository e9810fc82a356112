//! Monitor Worker
//!
//! The single consumer of the work queue. Per dequeued item:
//!
//! ```text
//! Claim -> Scan stations -> (none: Empty)
//!       -> for each station, for each image:
//!            StabilityWait -> Infer -> Persist -> Aggregate
//!       -> Completed
//! ```
//!
//! Image failures are logged and skipped; they never abort the item or the
//! loop. Cancellation is checked between items and between images, and is
//! honored inside stability waits and gate acquisition.

use crate::dedup::WorkDeduplicator;
use crate::error::{MonitorError, Result};
use crate::inference::{InferenceEngine, Thresholds, Verdict};
use crate::inference_gate::InferenceGate;
use crate::metrics::{self, Timer};
use crate::persistence::ResultPersistence;
use crate::queue::{display_name, WorkItem, WorkReceiver};
use crate::sink::{LogLevel, PresentationSink, ResultNotice};
use crate::stability::FileStabilityGate;
use crate::stats::StatisticsAggregator;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Input Layout
// ============================================================================

/// Naming conventions of the input tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLayout {
    /// Station directories start with this prefix (case-insensitive)
    pub station_prefix: String,
    /// Accepted image extensions, without the dot
    pub extensions: Vec<String>,
}

impl Default for InputLayout {
    fn default() -> Self {
        Self {
            station_prefix: "S".to_string(),
            extensions: ["jpg", "jpeg", "png", "bmp", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl InputLayout {
    pub fn is_station(&self, name: &str) -> bool {
        let prefix = self.station_prefix.as_bytes();
        name.len() >= prefix.len() && name.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix)
    }

    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

/// One station directory and its images, in processing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationImages {
    pub name: String,
    pub path: PathBuf,
    pub images: Vec<PathBuf>,
}

/// List stations of `work_item` in lexical name order (`S1, S10, S2`), each
/// with its images in lexical path order.
///
/// A station that vanishes or cannot be read while scanning is skipped.
pub fn scan_stations(work_item: &Path, layout: &InputLayout) -> std::io::Result<Vec<StationImages>> {
    let mut stations: Vec<(String, PathBuf)> = std::fs::read_dir(work_item)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            layout.is_station(&name).then(|| (name, entry.path()))
        })
        .collect();
    stations.sort_by(|a, b| a.0.cmp(&b.0));

    let mut result = Vec::with_capacity(stations.len());
    for (name, path) in stations {
        let mut images: Vec<PathBuf> = match std::fs::read_dir(&path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && layout.is_image(p))
                .collect(),
            Err(e) => {
                warn!(station = %path.display(), error = %e, "Skipping unreadable station");
                continue;
            }
        };
        images.sort();
        result.push(StationImages { name, path, images });
    }

    Ok(result)
}

// ============================================================================
// Worker
// ============================================================================

/// Terminal state of one work-item pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemOutcome {
    /// No station directories found
    Empty,
    /// Already handled and not invalidated by a new station
    AlreadyProcessed,
    /// All images attempted; `failed` were skipped
    Completed { processed: usize, failed: usize },
}

impl WorkItemOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkItemOutcome::Empty => "empty",
            WorkItemOutcome::AlreadyProcessed => "already_processed",
            WorkItemOutcome::Completed { failed: 0, .. } => "success",
            WorkItemOutcome::Completed { .. } => "partial",
        }
    }
}

pub struct MonitorWorker<E> {
    layout: InputLayout,
    thresholds: Thresholds,
    stability: FileStabilityGate,
    gate: InferenceGate<E>,
    persistence: ResultPersistence,
    stats: Arc<StatisticsAggregator>,
    dedup: WorkDeduplicator,
    sink: Arc<dyn PresentationSink>,
}

impl<E: InferenceEngine> MonitorWorker<E> {
    pub fn new(
        gate: InferenceGate<E>,
        persistence: ResultPersistence,
        stats: Arc<StatisticsAggregator>,
        dedup: WorkDeduplicator,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            layout: InputLayout::default(),
            thresholds: Thresholds::default(),
            stability: FileStabilityGate::default(),
            gate,
            persistence,
            stats,
            dedup,
            sink,
        }
    }

    pub fn with_layout(mut self, layout: InputLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_stability(mut self, stability: FileStabilityGate) -> Self {
        self.stability = stability;
        self
    }

    /// Drain `queue` until it closes or `cancel` fires.
    pub async fn run(self, mut queue: WorkReceiver, cancel: CancellationToken) {
        info!("Monitor worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            // Notification storms re-trigger the same path; one pass at a time
            let Some(_claim) = self.dedup.try_claim(&item.path) else {
                metrics::WORK_ITEMS_DROPPED_IN_FLIGHT.inc();
                debug!(work_item = %item.path.display(), "Already in flight, dropping");
                continue;
            };

            match self.process_work_item(&item, &cancel).await {
                Ok(outcome) => {
                    metrics::WORK_ITEMS.with_label_values(&[outcome.as_label()]).inc();
                    debug!(work_item = %item.path.display(), ?outcome, "Work item done");
                }
                Err(e) if e.is_cancelled() => {
                    debug!(work_item = %item.path.display(), "Work item interrupted by shutdown");
                    break;
                }
                Err(e) => {
                    metrics::WORK_ITEMS.with_label_values(&["failed"]).inc();
                    error!(work_item = %item.path.display(), error = %e, "Work item failed");
                    self.sink.on_log(
                        LogLevel::Error,
                        &format!("[MonitorWorker] {} failed: {}", item.path.display(), e),
                    );
                }
            }
        }

        let discarded = queue.close();
        info!(discarded, "Monitor worker stopped");
    }

    /// Process every image of every station of `item`.
    ///
    /// Returns `Err` only for cancellation or when the work-item directory
    /// itself cannot be listed.
    pub async fn process_work_item(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<WorkItemOutcome> {
        if !self.dedup.mark_processed(&item.path) {
            debug!(work_item = %item.path.display(), reason = %item.reason, "Already processed");
            return Ok(WorkItemOutcome::AlreadyProcessed);
        }

        let work_item_name = item.name();
        info!(work_item = %work_item_name, reason = %item.reason, "Processing work item");
        self.sink
            .on_log(LogLevel::Info, &format!("Processing work item: {}", work_item_name));

        let stations = {
            let path = item.path.clone();
            let layout = self.layout.clone();
            tokio::task::spawn_blocking(move || scan_stations(&path, &layout)).await??
        };

        if stations.is_empty() {
            self.sink.on_log(
                LogLevel::Warn,
                &format!("No station directories found in {}", work_item_name),
            );
            return Ok(WorkItemOutcome::Empty);
        }

        let mut processed = 0;
        let mut failed = 0;

        for station in &stations {
            self.sink.on_log(
                LogLevel::Info,
                &format!("Station {}: {} images", station.name, station.images.len()),
            );

            for image_path in &station.images {
                if cancel.is_cancelled() {
                    return Err(MonitorError::Cancelled);
                }

                match self.process_image(&work_item_name, &station.name, image_path, cancel).await {
                    Ok(_) => processed += 1,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        failed += 1;
                        metrics::IMAGE_FAILURES.with_label_values(&[e.stage()]).inc();
                        warn!(image = %image_path.display(), error = %e, "Image skipped");
                        self.sink.on_log(
                            LogLevel::Warn,
                            &format!("  -> error processing {}: {}", display_name(image_path), e),
                        );
                    }
                }
            }
        }

        info!(work_item = %work_item_name, processed, failed, "Work item complete");
        Ok(WorkItemOutcome::Completed { processed, failed })
    }

    async fn process_image(
        &self,
        work_item_name: &str,
        station_name: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ResultNotice> {
        let timer = Timer::new();

        self.stability.wait_ready(path, cancel).await?;
        let image = decode(path).await?;
        let (image, detections) = self.gate.infer(image, self.thresholds, cancel).await?;

        let persisted = self
            .persistence
            .persist(work_item_name, path, image, &detections, &self.thresholds)
            .await?;

        let verdict = Verdict::from_detections(&detections);
        let snapshot = self.stats.record(verdict);
        metrics::IMAGES_PROCESSED.with_label_values(&[verdict.as_label()]).inc();
        timer.observe_duration_seconds(&metrics::IMAGE_LATENCY);

        let notice = ResultNotice {
            work_item: work_item_name.to_string(),
            station: station_name.to_string(),
            source: path.to_path_buf(),
            output_path: persisted.output_path,
            verdict,
            detection_count: detections.len(),
            processing_ms: timer.elapsed_ms(),
            processed_at: chrono::Utc::now(),
        };

        self.sink.on_log(
            LogLevel::Info,
            &format!(
                "  -> {}: {} detections, {} ({} ms)",
                display_name(path),
                notice.detection_count,
                verdict,
                notice.processing_ms
            ),
        );
        self.sink.on_result(&notice);
        self.sink.on_statistics(snapshot);

        Ok(notice)
    }
}

async fn decode(path: &Path) -> Result<DynamicImage> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::open(&owned))
        .await?
        .map_err(|e| MonitorError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
