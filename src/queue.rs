//! Unbounded multi-producer / single-consumer work queue.

use crate::metrics;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Why a work item was enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkReason {
    /// New directory under the watch root
    Created,
    /// New station directory inside an existing work item
    StationAdded,
    /// Found by the initial scan at session start
    PreExisting,
}

impl fmt::Display for WorkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkReason::Created => "created",
            WorkReason::StationAdded => "station_added",
            WorkReason::PreExisting => "pre_existing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub reason: WorkReason,
}

impl WorkItem {
    pub fn new(path: impl Into<PathBuf>, reason: WorkReason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }

    /// Directory name used to mirror the item under the output root
    pub fn name(&self) -> String {
        display_name(&self.path)
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Producer side. Cheap to clone; every watch callback holds one.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

/// Consumer side, owned by the single monitor worker.
#[derive(Debug)]
pub struct WorkReceiver {
    rx: mpsc::UnboundedReceiver<WorkItem>,
}

/// Create a connected queue pair.
pub fn work_queue() -> (WorkQueue, WorkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, WorkReceiver { rx })
}

impl WorkQueue {
    /// Never blocks. Items sent after the consumer has shut down are discarded.
    pub fn enqueue(&self, item: WorkItem) {
        let path = item.path.clone();
        let reason = item.reason;
        match self.tx.send(item) {
            Ok(()) => {
                metrics::QUEUE_DEPTH.inc();
                debug!(work_item = %path.display(), %reason, "Work item enqueued");
            }
            Err(_) => {
                debug!(work_item = %path.display(), %reason, "Queue closed, dropping work item");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl WorkReceiver {
    /// Next item in FIFO order, or `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<WorkItem> {
        let item = self.rx.recv().await;
        if item.is_some() {
            metrics::QUEUE_DEPTH.dec();
        }
        item
    }

    pub fn try_recv(&mut self) -> Option<WorkItem> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            metrics::QUEUE_DEPTH.dec();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting new items and discard the ones still queued.
    ///
    /// Returns how many were discarded.
    pub fn close(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.try_recv().is_some() {
            discarded += 1;
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_with_duplicates() {
        let (queue, mut rx) = work_queue();
        queue.enqueue(WorkItem::new("/watch/A", WorkReason::Created));
        queue.enqueue(WorkItem::new("/watch/B", WorkReason::Created));
        queue.enqueue(WorkItem::new("/watch/A", WorkReason::StationAdded));

        assert_eq!(rx.recv().await.unwrap().path, PathBuf::from("/watch/A"));
        assert_eq!(rx.recv().await.unwrap().path, PathBuf::from("/watch/B"));
        let third = rx.recv().await.unwrap();
        assert_eq!(third.reason, WorkReason::StationAdded);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_many_producers_never_block() {
        let (queue, mut rx) = work_queue();

        let mut handles = Vec::new();
        for producer in 0..8 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    queue.enqueue(WorkItem::new(format!("/w/{}-{}", producer, i), WorkReason::Created));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 4000);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_silently_dropped() {
        let (queue, mut rx) = work_queue();
        rx.close();
        assert!(queue.is_closed());

        queue.enqueue(WorkItem::new("/watch/late", WorkReason::Created));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_discards_pending_items() {
        let (queue, mut rx) = work_queue();
        queue.enqueue(WorkItem::new("/watch/A", WorkReason::Created));
        queue.enqueue(WorkItem::new("/watch/B", WorkReason::PreExisting));
        queue.enqueue(WorkItem::new("/watch/C", WorkReason::StationAdded));
        assert_eq!(rx.len(), 3);

        assert_eq!(rx.close(), 3);
        assert!(rx.is_empty());
        assert!(rx.recv().await.is_none());
        assert_eq!(rx.close(), 0);
    }

    #[test]
    fn test_work_item_name() {
        let item = WorkItem::new("/watch/UNIT-0042", WorkReason::PreExisting);
        assert_eq!(item.name(), "UNIT-0042");
    }
}
