//! Admission control for in-flight capture work.
//!
//! The tracker enforces the per-stream buffer budgets the pipeline declared
//! at configuration time. Two populations count against a stream's budget:
//! buffers attached to submitted requests, and buffers the hardware layer
//! acquired on demand through the buffer management path. Waiters block on a
//! [`Notify`] until completions free budget, with a bounded timeout so a
//! stalled client surfaces as an error instead of a hang.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HalError, HalResult};
use crate::types::{CaptureRequest, HalStream, StreamBuffer, StreamId};

/// Default bound on admission waits.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct TrackerState {
    capacities: HashMap<StreamId, u32>,
    /// Buffers in flight via submitted requests, per stream.
    pending: HashMap<StreamId, u32>,
    /// Buffers acquired by the hardware layer on demand, per stream.
    acquired: HashMap<StreamId, u32>,
    /// Streams that have carried at least one request.
    requested_streams: HashSet<StreamId>,
}

impl TrackerState {
    fn fits(&self, wanted: &HashMap<StreamId, u32>) -> bool {
        wanted.iter().all(|(stream_id, count)| {
            let capacity = self.capacities.get(stream_id).copied().unwrap_or(0);
            let used = self.pending.get(stream_id).copied().unwrap_or(0)
                + self.acquired.get(stream_id).copied().unwrap_or(0);
            used + count <= capacity
        })
    }
}

/// Per-stream admission controller.
pub struct PendingRequestsTracker {
    state: Mutex<TrackerState>,
    space_freed: Notify,
    admission_timeout: Duration,
}

impl PendingRequestsTracker {
    /// Creates a tracker with budgets taken from `hal_streams`.
    pub fn new(hal_streams: &[HalStream], admission_timeout: Duration) -> Self {
        let capacities = hal_streams
            .iter()
            .map(|s| (s.id, s.max_buffers))
            .collect();
        Self {
            state: Mutex::new(TrackerState {
                capacities,
                ..TrackerState::default()
            }),
            space_freed: Notify::new(),
            admission_timeout,
        }
    }

    /// Waits for budget and tracks the attached output buffers of `request`.
    ///
    /// Placeholder buffers are not counted here; their budget is taken when
    /// the hardware layer actually acquires a buffer. Returns the stream ids
    /// seen for the first time by this tracker, so the caller can announce
    /// provider readiness for them. Fails with `BadValue` for unknown streams
    /// and `TimedOut` when budget never frees within the admission timeout.
    pub async fn wait_and_track_request(
        &self,
        request: &CaptureRequest,
    ) -> HalResult<Vec<StreamId>> {
        let mut wanted: HashMap<StreamId, u32> = HashMap::new();
        let mut target_streams: HashSet<StreamId> = HashSet::new();
        for buffer in &request.output_buffers {
            target_streams.insert(buffer.stream_id);
            if !buffer.is_placeholder() {
                *wanted.entry(buffer.stream_id).or_insert(0) += 1;
            }
        }
        {
            let state = self.state.lock();
            for stream_id in &target_streams {
                if !state.capacities.contains_key(stream_id) {
                    return Err(HalError::BadValue(format!(
                        "request {} targets untracked stream {}",
                        request.frame_number, stream_id
                    )));
                }
            }
        }

        let deadline = Instant::now() + self.admission_timeout;
        loop {
            let notified = self.space_freed.notified();
            {
                let mut state = self.state.lock();
                if state.fits(&wanted) {
                    let mut first_requested = Vec::new();
                    for (stream_id, count) in &wanted {
                        *state.pending.entry(*stream_id).or_insert(0) += count;
                    }
                    for stream_id in &target_streams {
                        if state.requested_streams.insert(*stream_id) {
                            first_requested.push(*stream_id);
                        }
                    }
                    debug!(
                        frame_number = request.frame_number,
                        streams = wanted.len(),
                        "request admitted"
                    );
                    return Ok(first_requested);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    frame_number = request.frame_number,
                    timeout_ms = self.admission_timeout.as_millis(),
                    "admission timeout - backpressure not clearing"
                );
                return Err(HalError::TimedOut(format!(
                    "admission of frame {}",
                    request.frame_number
                )));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Releases request budget for buffers returned in a capture result.
    ///
    /// Returns the streams whose pending request count dropped to zero.
    /// Releasing a buffer that was never tracked is a logged no-op; the
    /// result and error delivery paths can race on the same buffers.
    pub fn track_returned_result_buffers(&self, buffers: &[StreamBuffer]) -> Vec<StreamId> {
        let mut state = self.state.lock();
        let mut idle_streams = Vec::new();
        for buffer in buffers {
            match state.pending.get_mut(&buffer.stream_id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        idle_streams.push(buffer.stream_id);
                    }
                }
                _ => {
                    warn!(
                        stream_id = buffer.stream_id,
                        buffer_id = buffer.buffer_id,
                        "returned buffer was not tracked"
                    );
                }
            }
        }
        drop(state);
        self.space_freed.notify_waiters();
        idle_streams
    }

    /// Waits for budget and reserves `count` on-demand acquisitions.
    pub async fn wait_and_track_acquired_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> HalResult<()> {
        let wanted = HashMap::from([(stream_id, count)]);
        {
            let state = self.state.lock();
            if !state.capacities.contains_key(&stream_id) {
                return Err(HalError::BadValue(format!(
                    "acquisition on untracked stream {stream_id}"
                )));
            }
        }
        let deadline = Instant::now() + self.admission_timeout;
        loop {
            let notified = self.space_freed.notified();
            {
                let mut state = self.state.lock();
                if state.fits(&wanted) {
                    *state.acquired.entry(stream_id).or_insert(0) += count;
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(stream_id, count, "acquired-buffer wait timed out");
                return Err(HalError::TimedOut(format!(
                    "acquiring {count} buffers on stream {stream_id}"
                )));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Releases on-demand acquisitions for buffers the hardware layer
    /// returned.
    pub fn track_returned_acquired_buffers(&self, buffers: &[StreamBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            match state.acquired.get_mut(&buffer.stream_id) {
                Some(count) if *count > 0 => *count -= 1,
                _ => {
                    warn!(
                        stream_id = buffer.stream_id,
                        "returned acquired buffer was not tracked"
                    );
                }
            }
        }
        drop(state);
        self.space_freed.notify_waiters();
    }

    /// Releases a reservation after a buffer fetch failed.
    pub fn track_buffer_acquisition_failure(&self, stream_id: StreamId, count: u32) {
        {
            let mut state = self.state.lock();
            match state.acquired.get_mut(&stream_id) {
                Some(held) if *held >= count => *held -= count,
                _ => warn!(stream_id, count, "acquisition failure on untracked budget"),
            }
        }
        self.space_freed.notify_waiters();
    }

    /// Forgets first-requested marks for `streams` so they re-announce
    /// provider readiness. Used when an admitted request is resolved with a
    /// synthesized error instead of reaching the hardware layer.
    pub fn unrequest_streams(&self, streams: &[StreamId]) {
        let mut state = self.state.lock();
        for stream_id in streams {
            state.requested_streams.remove(stream_id);
        }
    }

    /// Whether nothing is tracked against any stream.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.values().all(|c| *c == 0) && state.acquired.values().all(|c| *c == 0)
    }

    /// Drops all tracked work and wakes every waiter. Flush path.
    ///
    /// The first-requested set resets too, so streams re-announce provider
    /// readiness on the next request targeting them.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.acquired.clear();
            state.requested_streams.clear();
        }
        self.space_freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn hal_stream(id: StreamId, max_buffers: u32) -> HalStream {
        HalStream {
            id,
            override_format: PixelFormat::Yuv420,
            producer_usage: 0,
            consumer_usage: 0,
            max_buffers,
            is_physical: false,
            physical_camera_id: None,
        }
    }

    fn request(frame_number: u32, stream_id: StreamId) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            output_buffers: vec![StreamBuffer {
                stream_id,
                buffer_id: u64::from(frame_number),
                ..StreamBuffer::default()
            }],
            ..CaptureRequest::default()
        }
    }

    #[tokio::test]
    async fn test_first_request_reports_new_stream() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 2)], Duration::from_millis(50));
        let first = tracker.wait_and_track_request(&request(1, 0)).await.unwrap();
        assert_eq!(first, vec![0]);
        let second = tracker.wait_and_track_request(&request(2, 0)).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_admission_blocks_at_capacity_and_releases() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 1)], Duration::from_millis(50));
        tracker.wait_and_track_request(&request(1, 0)).await.unwrap();

        // Budget exhausted, the next admission times out.
        let err = tracker
            .wait_and_track_request(&request(2, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::TimedOut(_)));

        // Completion frees the budget.
        let idle = tracker.track_returned_result_buffers(&request(1, 0).output_buffers);
        assert_eq!(idle, vec![0]);
        tracker.wait_and_track_request(&request(2, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_stream_rejected() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 1)], Duration::from_millis(50));
        let err = tracker
            .wait_and_track_request(&request(1, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::BadValue(_)));
    }

    #[tokio::test]
    async fn test_untracked_return_is_noop() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 1)], Duration::from_millis(50));
        let idle = tracker.track_returned_result_buffers(&request(5, 0).output_buffers);
        assert!(idle.is_empty());
        assert!(tracker.is_idle());
    }

    #[tokio::test]
    async fn test_acquired_buffers_share_budget() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 2)], Duration::from_millis(50));
        tracker.wait_and_track_acquired_buffers(0, 2).await.unwrap();

        let err = tracker
            .wait_and_track_request(&request(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::TimedOut(_)));

        tracker.track_buffer_acquisition_failure(0, 2);
        tracker.wait_and_track_request(&request(1, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_wakes_and_empties() {
        let tracker =
            PendingRequestsTracker::new(&[hal_stream(0, 1)], Duration::from_millis(50));
        tracker.wait_and_track_request(&request(1, 0)).await.unwrap();
        assert!(!tracker.is_idle());
        tracker.clear();
        assert!(tracker.is_idle());
    }
}
