pub mod config;
pub mod dedup;
pub mod error;
pub mod inference;
pub mod inference_gate;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod session;
pub mod sink;
pub mod stability;
pub mod stats;
pub mod watch;

// Re-export commonly used types for easier testing
pub use crate::config::{Config, MonitorConfig};
pub use crate::dedup::{ClaimGuard, WorkDeduplicator};
pub use crate::error::{MonitorError, Result};
pub use crate::inference::{BoundingBox, Detection, InferenceEngine, Thresholds, Verdict};
pub use crate::inference_gate::{InferenceGate, InferencePermit};
pub use crate::persistence::{DetectionRecord, PersistedResult, ResultPersistence};
pub use crate::pipeline::{scan_stations, InputLayout, MonitorWorker, WorkItemOutcome};
pub use crate::queue::{work_queue, WorkItem, WorkQueue, WorkReason, WorkReceiver};
pub use crate::session::MonitorSession;
pub use crate::sink::{ChannelSink, LogLevel, PresentationSink, ResultNotice, SinkEvent, TracingSink};
pub use crate::stability::{FileProbe, FileStabilityGate, FsProbe, StabilityPolicy};
pub use crate::stats::{Statistics, StatisticsAggregator};
pub use crate::watch::{
    BindingRole, DirectoryChangeSource, DirectoryEvent, NotifyChangeSource, WatchBackend,
    WatchHandle, WatchOptions,
};
