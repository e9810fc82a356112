//! Inference Gate
//!
//! Serializes access to the single inference engine instance. Every producer
//! (monitor worker, batch or single-file flows, camera capture) goes through the
//! same gate, so at most one inference call runs at any instant process-wide.
//!
//! Waiting for the gate is cooperative and honors cancellation; the engine call
//! itself runs on a blocking thread and is never interrupted once started.

use crate::error::{MonitorError, Result};
use crate::inference::{Detection, InferenceEngine, Thresholds};
use crate::metrics;
use image::DynamicImage;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Gate usage counters
#[derive(Debug, Default)]
struct GateMetrics {
    waiting: AtomicUsize,
    calls_completed: AtomicUsize,
}

/// Cloneable handle to the shared engine; clones share one engine and one lock.
pub struct InferenceGate<E> {
    engine: Arc<Mutex<E>>,
    metrics: Arc<GateMetrics>,
}

impl<E> Clone for InferenceGate<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E: InferenceEngine> InferenceGate<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            metrics: Arc::new(GateMetrics::default()),
        }
    }

    /// Wait for exclusive access to the engine.
    ///
    /// Returns `MonitorError::Cancelled` without entering the critical section
    /// if `cancel` fires first. Waiters are admitted in FIFO order.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<InferencePermit<E>> {
        let _waiting = WaitingGuard::new(self.metrics.clone());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Inference gate wait cancelled");
                Err(MonitorError::Cancelled)
            }
            guard = self.engine.clone().lock_owned() => Ok(InferencePermit {
                guard,
                metrics: self.metrics.clone(),
            }),
        }
    }

    /// Take the gate only if nobody holds it.
    pub fn try_acquire(&self) -> Option<InferencePermit<E>> {
        self.engine
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| InferencePermit {
                guard,
                metrics: self.metrics.clone(),
            })
    }

    /// Acquire the gate and run `work` against the engine on a blocking thread.
    ///
    /// The permit travels with the closure and is released when it returns, so
    /// the gate stays held for exactly the duration of the engine call.
    pub async fn run<F, R>(&self, cancel: &CancellationToken, work: F) -> Result<R>
    where
        F: FnOnce(&mut E) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut permit = self.acquire(cancel).await?;
        let output = tokio::task::spawn_blocking(move || {
            let output = work(&mut permit);
            drop(permit);
            output
        })
        .await?;
        Ok(output)
    }

    /// Run detection on `image`, handing the image back for annotation.
    pub async fn infer(
        &self,
        image: DynamicImage,
        thresholds: Thresholds,
        cancel: &CancellationToken,
    ) -> Result<(DynamicImage, Vec<Detection>)> {
        let timer = metrics::Timer::new();
        let (image, detections) = self
            .run(cancel, move |engine| {
                let detections = engine.detect(&image, &thresholds);
                (image, detections)
            })
            .await?;
        timer.observe_duration_seconds(&metrics::INFERENCE_LATENCY);

        let detections = detections.map_err(|e| MonitorError::Inference(format!("{:#}", e)))?;
        Ok((image, detections))
    }

    /// Callers currently blocked in `acquire`
    pub fn waiting(&self) -> usize {
        self.metrics.waiting.load(Ordering::Relaxed)
    }

    /// Permits released so far
    pub fn calls_completed(&self) -> usize {
        self.metrics.calls_completed.load(Ordering::Relaxed)
    }
}

/// Exclusive access to the engine; released on drop.
pub struct InferencePermit<E> {
    guard: OwnedMutexGuard<E>,
    metrics: Arc<GateMetrics>,
}

impl<E> Deref for InferencePermit<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.guard
    }
}

impl<E> DerefMut for InferencePermit<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.guard
    }
}

impl<E> Drop for InferencePermit<E> {
    fn drop(&mut self) {
        self.metrics.calls_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// RAII guard that tracks a caller waiting for the gate
struct WaitingGuard {
    metrics: Arc<GateMetrics>,
}

impl WaitingGuard {
    fn new(metrics: Arc<GateMetrics>) -> Self {
        metrics.waiting.fetch_add(1, Ordering::Relaxed);
        metrics::INFERENCE_GATE_WAITERS.inc();
        Self { metrics }
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.metrics.waiting.fetch_sub(1, Ordering::Relaxed);
        metrics::INFERENCE_GATE_WAITERS.dec();
    }
}
