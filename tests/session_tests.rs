//! End-to-end monitoring session tests
//!
//! These rely on real filesystem notifications (polling backend with short
//! intervals) and run serially to keep timing predictable.

mod common;

use common::{wait_until, write_image, MarkerEngine};
use serial_test::serial;
use station_monitor::{
    ChannelSink, InferenceGate, MonitorConfig, MonitorError, MonitorSession, SinkEvent,
    StabilityPolicy, Statistics, WatchBackend, WatchOptions, WorkReason,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(input: &Path, output: &Path) -> MonitorConfig {
    let mut config = MonitorConfig::new(input, output);
    config.watch = WatchOptions {
        debounce: Duration::from_millis(50),
        backend: WatchBackend::Poll,
        poll_interval: Duration::from_millis(50),
    };
    config.stability = StabilityPolicy {
        poll_interval: Duration::from_millis(10),
        max_attempts: 50,
    };
    config
}

async fn start(
    input: &TempDir,
    output: &TempDir,
    engine: MarkerEngine,
) -> (MonitorSession, UnboundedReceiver<SinkEvent>) {
    let (sink, sink_rx) = ChannelSink::new();
    let session = MonitorSession::start(
        &test_config(input.path(), output.path()),
        InferenceGate::new(engine),
        Arc::new(sink),
    )
    .await
    .unwrap();
    (session, sink_rx)
}

/// Build a work item outside the watch root, then move it in as a whole.
fn drop_in_work_item(input: &Path, staging: &TempDir, name: &str, images: &[(&str, bool)]) {
    let staged = staging.path().join(name);
    for (relative, defect) in images {
        write_image(&staged.join(relative), *defect);
    }
    std::fs::rename(&staged, input.join(name)).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_existing_work_items_processed_on_start() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_image(&input.path().join("A/S1/01.png"), false);
    write_image(&input.path().join("A/S2/01.png"), true);
    write_image(&input.path().join("B/S1/01.png"), false);

    let (session, _events) = start(&input, &output, MarkerEngine::new()).await;

    assert!(wait_until(TIMEOUT, || session.statistics().total == 3).await);
    assert_eq!(session.active_bindings(), 3);
    assert!(output.path().join("A/S2/01_FAIL.png").is_file());
    assert!(output.path().join("B/S1/01_PASS.png").is_file());

    let stats = session.stop().await;
    assert_eq!(stats, Statistics { total: 3, pass: 2, fail: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_new_work_item_and_new_station_are_detected() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let engine = MarkerEngine::new();

    let (session, _events) = start(&input, &output, engine.clone()).await;
    assert_eq!(session.active_bindings(), 1);

    drop_in_work_item(input.path(), &staging, "A", &[("S1/01.png", false), ("S1/02.png", true)]);
    assert!(wait_until(TIMEOUT, || session.statistics().total == 2).await);
    assert!(wait_until(TIMEOUT, || session.active_bindings() == 2).await);

    // New station: the whole work item is scanned again (2 + 1 images)
    let staged_station = staging.path().join("S2");
    write_image(&staged_station.join("01.png"), false);
    std::fs::rename(&staged_station, input.path().join("A/S2")).unwrap();

    assert!(wait_until(TIMEOUT, || session.statistics().total == 5).await);
    assert!(output.path().join("A/S2/01_PASS.png").is_file());

    let stats = session.stop().await;
    assert_eq!(stats, Statistics { total: 5, pass: 3, fail: 2 });
    assert_eq!(engine.call_count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_two_work_items_in_one_debounce_window() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let engine = MarkerEngine::new();

    let (session, _events) = start(&input, &output, engine.clone()).await;

    drop_in_work_item(input.path(), &staging, "A", &[("S1/01.png", false)]);
    drop_in_work_item(input.path(), &staging, "B", &[("S1/01.png", true)]);

    assert!(wait_until(TIMEOUT, || session.statistics().total >= 2).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(session.statistics(), Statistics { total: 2, pass: 1, fail: 1 });
    assert_eq!(engine.call_count(), 2);
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_manual_enqueue_of_station_added_forces_rerun() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_image(&input.path().join("A/S1/01.png"), false);

    let (session, _events) = start(&input, &output, MarkerEngine::new()).await;
    assert!(wait_until(TIMEOUT, || session.statistics().total == 1).await);

    // Plain re-notification is ignored, a station change is not
    session.enqueue(input.path().join("A"), WorkReason::Created);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.statistics().total, 1);

    session.enqueue(input.path().join("A"), WorkReason::StationAdded);
    assert!(wait_until(TIMEOUT, || session.statistics().total == 2).await);

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_restart_resets_statistics() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_image(&input.path().join("A/S1/01.png"), true);

    let (session, _events) = start(&input, &output, MarkerEngine::new()).await;
    assert!(wait_until(TIMEOUT, || session.statistics().total == 1).await);
    assert!(session.is_running());
    assert_eq!(session.stop().await.total, 1);

    let (session, _events) = start(&input, &output, MarkerEngine::new()).await;
    assert!(wait_until(TIMEOUT, || session.statistics().total == 1).await);
    assert_eq!(session.stop().await, Statistics { total: 1, pass: 0, fail: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_deleted_work_item_releases_its_binding() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_image(&input.path().join("A/S1/01.png"), false);
    write_image(&input.path().join("B/S1/01.png"), false);

    let (session, _events) = start(&input, &output, MarkerEngine::new()).await;
    assert!(wait_until(TIMEOUT, || session.statistics().total == 2).await);
    assert_eq!(session.active_bindings(), 3);

    std::fs::remove_dir_all(input.path().join("A")).unwrap();
    assert!(wait_until(TIMEOUT, || session.active_bindings() == 2).await);

    // The surviving work item is still watched for new stations
    let staging = TempDir::new().unwrap();
    let staged_station = staging.path().join("S2");
    write_image(&staged_station.join("01.png"), true);
    std::fs::rename(&staged_station, input.path().join("B/S2")).unwrap();
    assert!(wait_until(TIMEOUT, || session.statistics().total == 4).await);

    session.stop().await;
}

#[tokio::test]
#[serial]
async fn test_start_rejects_missing_watch_root() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let (sink, _rx) = ChannelSink::new();

    let result = MonitorSession::start(
        &test_config(&input.path().join("missing"), output.path()),
        InferenceGate::new(MarkerEngine::new()),
        Arc::new(sink),
    )
    .await;

    assert!(matches!(result, Err(MonitorError::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_sink_receives_progress() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_image(&input.path().join("A/S1/01.png"), false);

    let (session, mut events) = start(&input, &output, MarkerEngine::new()).await;
    assert!(wait_until(TIMEOUT, || session.statistics().total == 1).await);
    session.stop().await;

    let mut saw_result = false;
    let mut saw_started = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SinkEvent::Result(notice) => {
                saw_result = true;
                assert_eq!(notice.work_item, "A");
                assert_eq!(notice.station, "S1");
                assert!(notice.output_path.ends_with("A/S1/01_PASS.png"));
            }
            SinkEvent::Log { line, .. } if line.starts_with("Monitoring started") => saw_started = true,
            _ => {}
        }
    }
    assert!(saw_result);
    assert!(saw_started);
}
