//! File stability gate.
//!
//! Producers write images in place, so a file can be visible long before it is
//! complete. A file is ready once two consecutive polls report the same size
//! and it can be opened for reading without sharing write access.

use crate::error::{MonitorError, Result};
use crate::metrics;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Polling budget for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_attempts: 80,
        }
    }
}

/// Filesystem observations needed by the gate.
pub trait FileProbe {
    /// Current size, or `None` if the file does not exist (yet).
    fn size(&mut self, path: &Path) -> io::Result<Option<u64>>;

    /// Succeeds if the file can be opened for reading with no concurrent writer.
    fn try_open(&mut self, path: &Path) -> io::Result<()>;
}

/// Probe backed by the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn size(&mut self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(windows)]
    fn try_open(&mut self, path: &Path) -> io::Result<()> {
        use std::os::windows::fs::OpenOptionsExt;
        const FILE_SHARE_READ: u32 = 0x0000_0001;

        // Fails with a sharing violation while the producer still has it open for writing
        std::fs::OpenOptions::new()
            .read(true)
            .share_mode(FILE_SHARE_READ)
            .open(path)
            .map(|_| ())
    }

    #[cfg(not(windows))]
    fn try_open(&mut self, path: &Path) -> io::Result<()> {
        std::fs::File::open(path).map(|_| ())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileStabilityGate {
    policy: StabilityPolicy,
}

impl FileStabilityGate {
    pub fn new(policy: StabilityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> StabilityPolicy {
        self.policy
    }

    /// Wait until `path` is completely written. Returns the number of polls used.
    pub async fn wait_ready(&self, path: &Path, cancel: &CancellationToken) -> Result<u32> {
        self.wait_ready_with(&mut FsProbe, path, cancel).await
    }

    /// Same as [`wait_ready`](Self::wait_ready) with a caller-supplied probe.
    ///
    /// A missing file and transient probe errors both count as "not ready yet".
    /// The size comparison only succeeds against the immediately preceding poll,
    /// so a stable file returns on the second poll.
    pub async fn wait_ready_with<P: FileProbe>(
        &self,
        probe: &mut P,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_size: Option<u64> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(MonitorError::Cancelled);
            }

            match probe.size(path) {
                Ok(Some(size)) => {
                    if last_size == Some(size) {
                        match probe.try_open(path) {
                            Ok(()) => {
                                debug!(path = %path.display(), attempt, size, "File stable");
                                metrics::STABILITY_ATTEMPTS.observe(f64::from(attempt));
                                return Ok(attempt);
                            }
                            Err(e) => trace!(path = %path.display(), error = %e, "File still locked"),
                        }
                    }
                    last_size = Some(size);
                }
                Ok(None) => {
                    trace!(path = %path.display(), attempt, "File not present yet");
                    last_size = None;
                }
                Err(e) => trace!(path = %path.display(), error = %e, "Probe failed"),
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
                    _ = tokio::time::sleep(self.policy.poll_interval) => {}
                }
            }
        }

        Err(MonitorError::FileNotReady {
            path: path.to_path_buf(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Replays a fixed sequence of size observations; the last one repeats.
    struct ScriptedProbe {
        sizes: VecDeque<Option<u64>>,
        locked_polls: u32,
        size_calls: u32,
        open_calls: u32,
    }

    impl ScriptedProbe {
        fn new(sizes: &[Option<u64>]) -> Self {
            Self {
                sizes: sizes.iter().copied().collect(),
                locked_polls: 0,
                size_calls: 0,
                open_calls: 0,
            }
        }

        fn locked_for(mut self, polls: u32) -> Self {
            self.locked_polls = polls;
            self
        }
    }

    impl FileProbe for ScriptedProbe {
        fn size(&mut self, _path: &Path) -> io::Result<Option<u64>> {
            self.size_calls += 1;
            if self.sizes.len() > 1 {
                Ok(self.sizes.pop_front().flatten())
            } else {
                Ok(self.sizes.front().copied().flatten())
            }
        }

        fn try_open(&mut self, _path: &Path) -> io::Result<()> {
            self.open_calls += 1;
            if self.open_calls <= self.locked_polls {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "sharing violation"))
            } else {
                Ok(())
            }
        }
    }

    fn fast_gate(max_attempts: u32) -> FileStabilityGate {
        FileStabilityGate::new(StabilityPolicy {
            poll_interval: Duration::from_millis(1),
            max_attempts,
        })
    }

    fn image_path() -> PathBuf {
        PathBuf::from("A/S1/001.png")
    }

    #[tokio::test]
    async fn test_growing_file_returns_only_after_stable_size() {
        let gate = fast_gate(80);
        let mut probe = ScriptedProbe::new(&[Some(10), Some(20), Some(30), Some(30)]);

        let polls = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(polls, 4);
        assert_eq!(probe.size_calls, 4);
        assert_eq!(probe.open_calls, 1);
    }

    #[tokio::test]
    async fn test_stable_file_returns_on_first_consistent_observation() {
        let gate = fast_gate(80);
        let mut probe = ScriptedProbe::new(&[Some(4096)]);

        let polls = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(polls, 2);

        // Running it again behaves the same
        let polls = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(polls, 2);
        assert_eq!(probe.size_calls, 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error_until_budget_exhausted() {
        let gate = fast_gate(5);
        let mut probe = ScriptedProbe::new(&[None]);

        let err = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MonitorError::FileNotReady { attempts: 5, .. }));
        assert_eq!(probe.size_calls, 5);
        assert_eq!(probe.open_calls, 0);
    }

    #[tokio::test]
    async fn test_file_appearing_late_is_picked_up() {
        let gate = fast_gate(10);
        let mut probe = ScriptedProbe::new(&[None, None, Some(7), Some(7)]);

        let polls = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_locked_file_waits_for_writer_to_close() {
        let gate = fast_gate(10);
        let mut probe = ScriptedProbe::new(&[Some(100)]).locked_for(2);

        let polls = gate
            .wait_ready_with(&mut probe, &image_path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(polls, 4);
        assert_eq!(probe.open_calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let gate = FileStabilityGate::new(StabilityPolicy {
            poll_interval: Duration::from_secs(30),
            max_attempts: 80,
        });
        let cancel = CancellationToken::new();
        let mut probe = ScriptedProbe::new(&[None]);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = gate
            .wait_ready_with(&mut probe, &image_path(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_real_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, b"complete").unwrap();

        let polls = fast_gate(10)
            .wait_ready(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(polls, 2);
    }
}
