//! Presentation sink: one-way progress notifications out of the pipeline.
//!
//! Nothing the sink does feeds back into processing. Implementations must not
//! block for long since they are called inline from the worker.

use crate::inference::Verdict;
use crate::stats::Statistics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// "New result image available"
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultNotice {
    pub work_item: String,
    pub station: String,
    pub source: PathBuf,
    pub output_path: PathBuf,
    pub verdict: Verdict,
    pub detection_count: usize,
    pub processing_ms: u64,
    pub processed_at: DateTime<Utc>,
}

pub trait PresentationSink: Send + Sync + 'static {
    fn on_log(&self, level: LogLevel, line: &str);

    fn on_statistics(&self, stats: Statistics);

    fn on_result(&self, notice: &ResultNotice);
}

/// Default sink that renders everything through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl PresentationSink for TracingSink {
    fn on_log(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Info => info!(target: "station_monitor::sink", "{}", line),
            LogLevel::Warn => warn!(target: "station_monitor::sink", "{}", line),
            LogLevel::Error => error!(target: "station_monitor::sink", "{}", line),
        }
    }

    fn on_statistics(&self, stats: Statistics) {
        info!(
            target: "station_monitor::sink",
            total = stats.total,
            pass = stats.pass,
            fail = stats.fail,
            yield_rate = format!("{:.1}%", stats.yield_rate()),
            "Statistics updated"
        );
    }

    fn on_result(&self, notice: &ResultNotice) {
        info!(
            target: "station_monitor::sink",
            work_item = %notice.work_item,
            station = %notice.station,
            verdict = %notice.verdict,
            detections = notice.detection_count,
            processing_ms = notice.processing_ms,
            output = %notice.output_path.display(),
            "Result saved"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SinkEvent {
    Log { level: LogLevel, line: String },
    Statistics(Statistics),
    Result(ResultNotice),
}

/// Forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // Receiver gone means nobody is watching any more
        let _ = self.tx.send(event);
    }
}

impl PresentationSink for ChannelSink {
    fn on_log(&self, level: LogLevel, line: &str) {
        self.send(SinkEvent::Log {
            level,
            line: line.to_string(),
        });
    }

    fn on_statistics(&self, stats: Statistics) {
        self.send(SinkEvent::Statistics(stats));
    }

    fn on_result(&self, notice: &ResultNotice) {
        self.send(SinkEvent::Result(notice.clone()));
    }
}
