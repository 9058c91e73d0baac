//! Session-scoped capture telemetry.
//!
//! Counters are owned by the session that creates them instead of living in
//! process-global state, so concurrent sessions never interleave numbers.
//! Everything is relaxed atomics; these are statistics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::types::CameraId;

/// Counters for one device session.
#[derive(Debug, Default)]
pub struct SessionTelemetry {
    camera_id: CameraId,
    requests_accepted: AtomicU64,
    results_delivered: AtomicU64,
    frames_errored: AtomicU64,
    buffer_requests: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Requests admitted into the pipeline.
    pub requests_accepted: u64,
    /// Capture results forwarded to the client.
    pub results_delivered: u64,
    /// Frames that ended in an error notification.
    pub frames_errored: u64,
    /// Buffers fetched on behalf of the hardware layer.
    pub buffer_requests: u64,
    /// Flush calls served.
    pub flushes: u64,
}

impl SessionTelemetry {
    /// Creates zeroed counters for `camera_id`.
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            ..Self::default()
        }
    }

    pub(crate) fn request_accepted(&self) {
        self.requests_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn result_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_errored(&self) {
        self.frames_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_requested(&self, count: u64) {
        self.buffer_requests.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            requests_accepted: self.requests_accepted.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            frames_errored: self.frames_errored.load(Ordering::Relaxed),
            buffer_requests: self.buffer_requests.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    /// Logs a one-line summary, called on session teardown.
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        info!(
            camera_id = self.camera_id,
            requests = snap.requests_accepted,
            results = snap.results_delivered,
            errored = snap.frames_errored,
            flushes = snap.flushes,
            "session telemetry"
        );
    }
}
