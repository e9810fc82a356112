//! Monitoring session lifecycle.
//!
//! A session owns everything that lives between "start monitoring" and "stop
//! monitoring": the work queue, the deduplication sets, fresh statistics, the
//! watch binding registry, the directory-event handler and the worker.

use crate::config::MonitorConfig;
use crate::dedup::WorkDeduplicator;
use crate::error::{MonitorError, Result};
use crate::inference::InferenceEngine;
use crate::inference_gate::InferenceGate;
use crate::persistence::ResultPersistence;
use crate::pipeline::{InputLayout, MonitorWorker};
use crate::queue::{display_name, work_queue, WorkItem, WorkQueue, WorkReason};
use crate::sink::{LogLevel, PresentationSink};
use crate::stability::FileStabilityGate;
use crate::stats::{Statistics, StatisticsAggregator};
use crate::watch::{
    BindingRole, DirectoryChangeSource, DirectoryEvent, NotifyChangeSource, WatchHandle,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MonitorSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    watch_path: PathBuf,
    cancel: CancellationToken,
    stats: Arc<StatisticsAggregator>,
    dedup: WorkDeduplicator,
    queue: WorkQueue,
    source: Arc<dyn DirectoryChangeSource>,
    sink: Arc<dyn PresentationSink>,
    worker: JoinHandle<()>,
    event_loop: JoinHandle<()>,
}

impl MonitorSession {
    /// Start watching `config.watch_path`.
    ///
    /// Existing work-item directories are bound and enqueued immediately, so
    /// a restart picks up whatever arrived while monitoring was off.
    pub async fn start<E: InferenceEngine>(
        config: &MonitorConfig,
        gate: InferenceGate<E>,
        sink: Arc<dyn PresentationSink>,
    ) -> Result<Self> {
        config.validate()?;

        let watch_path = config.watch_path.clone();
        if !tokio::fs::metadata(&watch_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(MonitorError::Config(format!(
                "Watch path is not a directory: {}",
                watch_path.display()
            )));
        }
        tokio::fs::create_dir_all(&config.output_path).await?;

        let cancel = CancellationToken::new();
        let stats = Arc::new(StatisticsAggregator::new());
        let dedup = WorkDeduplicator::new();
        let (queue, receiver) = work_queue();

        let worker = MonitorWorker::new(
            gate,
            ResultPersistence::new(&config.output_path, config.generate_json),
            stats.clone(),
            dedup.clone(),
            sink.clone(),
        )
        .with_layout(config.layout.clone())
        .with_thresholds(config.thresholds)
        .with_stability(FileStabilityGate::new(config.stability));
        let worker = tokio::spawn(worker.run(receiver, cancel.clone()));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let source: Arc<dyn DirectoryChangeSource> =
            Arc::new(NotifyChangeSource::new(config.watch, event_tx)?);

        if let Err(e) = source.bind(&watch_path, BindingRole::Root) {
            cancel.cancel();
            let _ = worker.await;
            return Err(e);
        }

        let handler = EventHandler {
            queue: queue.clone(),
            dedup: dedup.clone(),
            source: source.clone(),
            layout: config.layout.clone(),
            sink: sink.clone(),
        };
        let event_loop = tokio::spawn(handler.run(event_rx, cancel.clone()));

        let session = Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            watch_path,
            cancel,
            stats,
            dedup,
            queue,
            source,
            sink,
            worker,
            event_loop,
        };

        session.enqueue_existing().await;
        session
            .sink
            .on_log(LogLevel::Info, &format!("Monitoring started: {}", session.watch_path.display()));
        info!(
            session_id = %session.id,
            watch_path = %session.watch_path.display(),
            "Monitoring session started"
        );

        Ok(session)
    }

    async fn enqueue_existing(&self) {
        let root = self.watch_path.clone();
        let listing = tokio::task::spawn_blocking(move || list_subdirectories(&root)).await;

        let directories = match listing {
            Ok(Ok(directories)) => directories,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list existing directories");
                self.sink
                    .on_log(LogLevel::Error, &format!("Failed to list existing directories: {}", e));
                return;
            }
            Err(e) => {
                warn!(error = %e, "Directory listing task failed");
                return;
            }
        };

        self.sink.on_log(
            LogLevel::Info,
            &format!("Found {} existing directories", directories.len()),
        );
        for dir in directories {
            if let Err(e) = bind_work_item(&self.source, &dir).await {
                warn!(work_item = %dir.display(), error = %e, "Failed to watch existing work item");
            }
            self.queue.enqueue(WorkItem::new(dir, WorkReason::PreExisting));
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn watch_path(&self) -> &Path {
        &self.watch_path
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    /// Shared handle for observers such as the status API
    pub fn stats_handle(&self) -> Arc<StatisticsAggregator> {
        self.stats.clone()
    }

    pub fn deduplicator(&self) -> &WorkDeduplicator {
        &self.dedup
    }

    pub fn active_bindings(&self) -> usize {
        self.source.active_bindings()
    }

    /// Enqueue a work item by hand (e.g. an operator re-run request).
    pub fn enqueue(&self, path: impl Into<PathBuf>, reason: WorkReason) {
        let path = path.into();
        if reason == WorkReason::StationAdded {
            self.dedup.forget_processed(&path);
        }
        self.queue.enqueue(WorkItem::new(path, reason));
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.worker.is_finished()
    }

    /// Cancel, tear down every binding, wait for the tasks and return the final
    /// statistics.
    pub async fn stop(self) -> Statistics {
        self.cancel.cancel();
        self.source.unbind_all();

        if let Err(e) = self.worker.await {
            warn!(error = %e, "Monitor worker task ended abnormally");
        }
        if let Err(e) = self.event_loop.await {
            warn!(error = %e, "Directory event task ended abnormally");
        }

        let stats = self.stats.snapshot();
        self.sink.on_log(LogLevel::Info, "Monitoring stopped");
        self.sink.on_statistics(stats);
        let uptime = Utc::now() - self.started_at;
        info!(
            session_id = %self.id,
            uptime_secs = uptime.num_seconds(),
            total = stats.total,
            pass = stats.pass,
            fail = stats.fail,
            "Monitoring session stopped"
        );
        stats
    }
}

/// Turns directory events into queue operations and child bindings.
struct EventHandler {
    queue: WorkQueue,
    dedup: WorkDeduplicator,
    source: Arc<dyn DirectoryChangeSource>,
    layout: InputLayout,
    sink: Arc<dyn PresentationSink>,
}

impl EventHandler {
    async fn run(self, mut events: mpsc::UnboundedReceiver<DirectoryEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        debug!("Directory event handler stopped");
    }

    async fn handle(&self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::WorkItemCreated { path } => {
                self.sink
                    .on_log(LogLevel::Info, &format!("New work item: {}", display_name(&path)));
                // Bind before enqueueing so stations created during the pass are seen
                if let Err(e) = bind_work_item(&self.source, &path).await {
                    warn!(work_item = %path.display(), error = %e, "Failed to watch work item");
                    self.sink.on_log(LogLevel::Warn, &e.to_string());
                }
                self.queue.enqueue(WorkItem::new(path, WorkReason::Created));
            }
            DirectoryEvent::StationDirCreated { work_item, path } => {
                let station = display_name(&path);
                if !self.layout.is_station(&station) {
                    debug!(path = %path.display(), "Ignoring non-station directory");
                    return;
                }

                self.sink.on_log(
                    LogLevel::Info,
                    &format!("New station: {}/{}", display_name(&work_item), station),
                );
                // Reprocess the whole work item, not just the new station
                self.dedup.forget_processed(&work_item);
                self.queue.enqueue(WorkItem::new(work_item, WorkReason::StationAdded));
            }
            DirectoryEvent::BindingFailed { path, reason } => {
                self.sink.on_log(
                    LogLevel::Error,
                    &format!("Watch error on {}: {}", path.display(), reason),
                );
            }
        }
    }
}

/// `bind` talks to the backend watcher synchronously; keep it off the runtime workers.
async fn bind_work_item(source: &Arc<dyn DirectoryChangeSource>, path: &Path) -> Result<WatchHandle> {
    let source = source.clone();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || source.bind(&path, BindingRole::WorkItem)).await?
}

fn list_subdirectories(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkReceiver;
    use crate::sink::{ChannelSink, SinkEvent};
    use std::sync::Mutex;

    /// Records bind calls without touching the OS
    #[derive(Default)]
    struct RecordingSource {
        bound: Mutex<Vec<PathBuf>>,
    }

    impl DirectoryChangeSource for RecordingSource {
        fn bind(&self, path: &Path, role: BindingRole) -> Result<WatchHandle> {
            assert_eq!(role, BindingRole::WorkItem);
            self.bound.lock().unwrap().push(path.to_path_buf());
            Err(MonitorError::Watch {
                path: path.to_path_buf(),
                reason: "test source".to_string(),
            })
        }

        fn unbind(&self, _handle: &WatchHandle) -> bool {
            false
        }

        fn unbind_all(&self) {}

        fn active_bindings(&self) -> usize {
            self.bound.lock().unwrap().len()
        }
    }

    fn handler() -> (EventHandler, WorkReceiver, Arc<RecordingSource>, mpsc::UnboundedReceiver<SinkEvent>) {
        let (queue, receiver) = work_queue();
        let source = Arc::new(RecordingSource::default());
        let (sink, sink_rx) = ChannelSink::new();
        let handler = EventHandler {
            queue,
            dedup: WorkDeduplicator::new(),
            source: source.clone(),
            layout: InputLayout::default(),
            sink: Arc::new(sink),
        };
        (handler, receiver, source, sink_rx)
    }

    #[tokio::test]
    async fn test_work_item_created_binds_and_enqueues() {
        let (handler, mut rx, source, _sink) = handler();
        handler.handle(DirectoryEvent::WorkItemCreated { path: "/w/A".into() }).await;

        assert_eq!(*source.bound.lock().unwrap(), vec![PathBuf::from("/w/A")]);
        assert_eq!(rx.try_recv(), Some(WorkItem::new("/w/A", WorkReason::Created)));
    }

    #[tokio::test]
    async fn test_station_created_clears_processed_and_enqueues() {
        let (handler, mut rx, _source, _sink) = handler();
        handler.dedup.mark_processed(Path::new("/w/A"));

        handler.handle(DirectoryEvent::StationDirCreated {
            work_item: "/w/A".into(),
            path: "/w/A/s2".into(),
        }).await;

        assert!(!handler.dedup.is_processed(Path::new("/w/A")));
        assert_eq!(rx.try_recv(), Some(WorkItem::new("/w/A", WorkReason::StationAdded)));
    }

    #[tokio::test]
    async fn test_non_station_directory_is_ignored() {
        let (handler, mut rx, _source, _sink) = handler();
        handler.dedup.mark_processed(Path::new("/w/A"));

        handler.handle(DirectoryEvent::StationDirCreated {
            work_item: "/w/A".into(),
            path: "/w/A/thumbnails".into(),
        }).await;

        assert!(handler.dedup.is_processed(Path::new("/w/A")));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_binding_failure_reaches_sink() {
        let (handler, _rx, _source, mut sink_rx) = handler();
        handler.handle(DirectoryEvent::BindingFailed {
            path: "/w/A".into(),
            reason: "access denied".into(),
        }).await;

        match sink_rx.try_recv().unwrap() {
            SinkEvent::Log { level, line } => {
                assert_eq!(level, LogLevel::Error);
                assert!(line.contains("access denied"));
            }
            other => panic!("unexpected sink event: {:?}", other),
        }
    }
}
