use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Image metrics
    pub static ref IMAGES_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("images_processed_total", "Total number of classified images by verdict"),
        &["verdict"]
    ).unwrap();

    pub static ref IMAGE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("image_failures_total", "Images skipped because a pipeline stage failed"),
        &["stage"]
    ).unwrap();

    pub static ref IMAGE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "image_processing_duration_seconds",
            "End-to-end per-image latency (stability wait to persistence) in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    // Work item metrics
    pub static ref WORK_ITEMS: IntCounterVec = IntCounterVec::new(
        Opts::new("work_items_total", "Work items finished by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref WORK_ITEMS_DROPPED_IN_FLIGHT: IntCounter = IntCounter::new(
        "work_items_dropped_in_flight_total",
        "Work items dropped because the same path was already being processed"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "work_queue_depth",
        "Current number of queued work items"
    ).unwrap();

    // Watch metrics
    pub static ref WATCH_BINDINGS: IntGauge = IntGauge::new(
        "watch_bindings_active",
        "Current number of active directory watch bindings"
    ).unwrap();

    pub static ref WATCH_ERRORS: IntCounter = IntCounter::new(
        "watch_errors_total",
        "Total number of errors reported by directory watch bindings"
    ).unwrap();

    // Inference metrics
    pub static ref INFERENCE_GATE_WAITERS: IntGauge = IntGauge::new(
        "inference_gate_waiters",
        "Callers currently waiting for the inference gate"
    ).unwrap();

    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Inference engine call latency in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    ).unwrap();

    pub static ref STABILITY_ATTEMPTS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "stability_wait_attempts",
            "Polls needed before an image file was considered stable"
        )
        .buckets(vec![2.0, 3.0, 5.0, 10.0, 20.0, 40.0, 80.0])
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(IMAGES_PROCESSED.clone()),
        Box::new(IMAGE_FAILURES.clone()),
        Box::new(IMAGE_LATENCY.clone()),
        Box::new(WORK_ITEMS.clone()),
        Box::new(WORK_ITEMS_DROPPED_IN_FLIGHT.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(WATCH_BINDINGS.clone()),
        Box::new(WATCH_ERRORS.clone()),
        Box::new(INFERENCE_GATE_WAITERS.clone()),
        Box::new(INFERENCE_LATENCY.clone()),
        Box::new(STABILITY_ATTEMPTS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!("Failed to register metric collector: {}", e);
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
