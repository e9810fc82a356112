use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use station_monitor::config::{ApiConfig, Config, InferenceConfig};
use station_monitor::inference::InferenceEngine;
use station_monitor::inference_gate::InferenceGate;
use station_monitor::metrics;
use station_monitor::session::MonitorSession;
use station_monitor::sink::{PresentationSink, TracingSink};
use station_monitor::stats::StatisticsAggregator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    pass: u64,
    fail: u64,
    yield_rate: f64,
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

/// Current session statistics
async fn stats_handler(State(stats): State<Arc<StatisticsAggregator>>) -> Json<StatsResponse> {
    let snapshot = stats.snapshot();
    Json(StatsResponse {
        total: snapshot.total,
        pass: snapshot.pass,
        fail: snapshot.fail,
        yield_rate: snapshot.yield_rate(),
    })
}

/// Serve the status API until `shutdown` fires
async fn start_status_server(
    config: ApiConfig,
    stats: Arc<StatisticsAggregator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(stats);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    tracing::info!("Status API listening on http://{}:{}", config.host, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("Status server error: {}", e))
}

#[cfg(feature = "onnx")]
fn build_engine(config: &InferenceConfig) -> Result<Box<dyn InferenceEngine>> {
    use station_monitor::inference::OnnxDetector;

    let model_path = config
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("MODEL_PATH (or ModelPath in config.json) is not set"))?;
    let detector = OnnxDetector::load(model_path, config.input_size, config.labels.clone())?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "onnx"))]
fn build_engine(_config: &InferenceConfig) -> Result<Box<dyn InferenceEngine>> {
    Err(anyhow::anyhow!(
        "No inference backend compiled in; rebuild with `--features onnx`"
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    .add_directive("notify=warn".parse().unwrap())
                    .add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting station monitor...");

    // Initialize metrics
    metrics::init_metrics();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        watch_path = %config.monitor.watch_path.display(),
        output_path = %config.monitor.output_path.display(),
        confidence = config.monitor.thresholds.confidence,
        pixel_confidence = config.monitor.thresholds.pixel_confidence,
        iou = config.monitor.thresholds.iou,
        generate_json = config.monitor.generate_json,
        "Configuration loaded"
    );

    let engine = build_engine(&config.inference)?;
    let gate = InferenceGate::new(engine);
    let sink: Arc<dyn PresentationSink> = Arc::new(TracingSink);

    let session = MonitorSession::start(&config.monitor, gate, sink).await?;

    let shutdown = CancellationToken::new();
    let api_task = if config.api.enabled {
        let api_config = config.api.clone();
        let stats = session.stats_handle();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_status_server(api_config, stats, shutdown).await {
                tracing::error!("❌ {}", e);
            }
        }))
    } else {
        tracing::info!("Status API disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let stats = session.stop().await;
    shutdown.cancel();
    if let Some(task) = api_task {
        let _ = task.await;
    }

    tracing::info!(
        total = stats.total,
        pass = stats.pass,
        fail = stats.fail,
        "Final statistics (yield {:.1}%)",
        stats.yield_rate()
    );
    Ok(())
}
