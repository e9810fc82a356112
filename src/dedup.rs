//! Single-flight admission for work items.
//!
//! Two concurrent sets, both keyed by work-item path:
//! - in-flight: paths a worker currently owns
//! - processed: paths handled at least once this session
//!
//! `claim` and `mark_processed` are single atomic insert operations, so no
//! caller ever needs a second lock to test and update membership.

use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct WorkDeduplicator {
    in_flight: Arc<DashSet<PathBuf>>,
    processed: Arc<DashSet<PathBuf>>,
}

impl WorkDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this caller won ownership of `path`.
    pub fn claim(&self, path: &Path) -> bool {
        let won = self.in_flight.insert(path.to_path_buf());
        trace!(work_item = %path.display(), won, "Claim");
        won
    }

    pub fn release(&self, path: &Path) {
        self.in_flight.remove(path);
    }

    /// Claim that releases itself when dropped, including on early return or panic.
    pub fn try_claim(&self, path: &Path) -> Option<ClaimGuard> {
        if self.claim(path) {
            Some(ClaimGuard {
                in_flight: self.in_flight.clone(),
                path: path.to_path_buf(),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight.contains(path)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Record `path` as processed. Returns false if it already was.
    pub fn mark_processed(&self, path: &Path) -> bool {
        self.processed.insert(path.to_path_buf())
    }

    /// Force the next pass over `path` to run again (new station detected).
    pub fn forget_processed(&self, path: &Path) -> bool {
        self.processed.remove(path).is_some()
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        self.processed.contains(path)
    }

    /// Drop all state; used when a session starts over.
    pub fn clear(&self) {
        self.in_flight.clear();
        self.processed.clear();
    }
}

/// Ownership of one in-flight work item
#[derive(Debug)]
pub struct ClaimGuard {
    in_flight: Arc<DashSet<PathBuf>>,
    path: PathBuf,
}

impl ClaimGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_claim_is_exclusive_until_release() {
        let dedup = WorkDeduplicator::new();
        let path = Path::new("/watch/A");

        assert!(dedup.claim(path));
        assert!(!dedup.claim(path));
        assert!(dedup.is_in_flight(path));

        dedup.release(path);
        assert!(!dedup.is_in_flight(path));
        assert!(dedup.claim(path));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dedup = WorkDeduplicator::new();
        let path = Path::new("/watch/A");

        {
            let guard = dedup.try_claim(path).unwrap();
            assert_eq!(guard.path(), path);
            assert!(dedup.try_claim(path).is_none());
        }

        assert_eq!(dedup.in_flight_count(), 0);
        assert!(dedup.try_claim(path).is_some());
    }

    #[test]
    fn test_processed_set_forget_forces_reprocess() {
        let dedup = WorkDeduplicator::new();
        let path = Path::new("/watch/A");

        assert!(dedup.mark_processed(path));
        assert!(!dedup.mark_processed(path));

        assert!(dedup.forget_processed(path));
        assert!(!dedup.forget_processed(path));
        assert!(dedup.mark_processed(path));
    }

    #[test]
    fn test_single_flight_under_contention() {
        let dedup = WorkDeduplicator::new();
        let active = std::sync::Arc::new(AtomicUsize::new(0));
        let max_active = std::sync::Arc::new(AtomicUsize::new(0));
        let passes = std::sync::Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dedup = dedup.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            let passes = passes.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(_guard) = dedup.try_claim(Path::new("/watch/A")) {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                        passes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(passes.load(Ordering::SeqCst) >= 1);
    }
}
