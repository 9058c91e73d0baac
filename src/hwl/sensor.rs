//! Simulated sensor capture loop.
//!
//! One free-running tokio task per session emulates the sensor's frame
//! timing: each cycle pops at most one queued request, renders its output
//! buffers from the synthetic scene, notifies shutter and result, then sleeps
//! out the remaining frame duration as vertical blank. Idle cycles still
//! advance vsync so nothing waiting on frame timing starves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CameraCharacteristics;
use crate::error::{HalError, HalResult};
use crate::hwl::request_state::LogicalCameraSettings;
use crate::hwl::scene::{
    self, RenderParams, Scene,
};
use crate::hwl::{HwlPipelineResult, PipelineCallback};
use crate::metadata::Tag;
use crate::session::buffer_import::BufferImporter;
use crate::types::{
    BufferStatus, ErrorCode, NotifyMessage, PipelineId, PixelFormat, Stream, StreamBuffer,
    StreamId, StreamType,
};

/// Bound on waiting for queue space when the pipeline is saturated.
const QUEUE_SPACE_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on waiting for the in-flight cycle during flush.
const FLUSH_CYCLE_TIMEOUT: Duration = Duration::from_secs(2);

/// One request queued for capture.
pub struct SensorRequest {
    /// Frame number of the originating capture request.
    pub frame_number: u32,
    /// Pipeline the request belongs to.
    pub pipeline_id: PipelineId,
    /// Per-device settings derived by the 3A layer.
    pub settings: LogicalCameraSettings,
    /// Result shell prebuilt by the 3A layer.
    pub result: HwlPipelineResult,
    /// Reprocess input buffers (0 or 1).
    pub input_buffers: Vec<StreamBuffer>,
    /// Output buffers to fill.
    pub output_buffers: Vec<StreamBuffer>,
    /// Timestamp to reuse for reprocess requests, from the request settings.
    pub reprocess_timestamp_ns: Option<i64>,
}

struct SensorShared {
    chars: Arc<CameraCharacteristics>,
    streams: HashMap<StreamId, Stream>,
    importer: Arc<dyn BufferImporter>,
    callback: Arc<dyn PipelineCallback>,
    queue: Mutex<VecDeque<SensorRequest>>,
    queue_space: Notify,
    running: AtomicBool,
    vsync_tx: watch::Sender<u64>,
}

/// Whether a reprocess input format may feed an output format.
pub fn reprocess_compatible(input: PixelFormat, output: PixelFormat) -> bool {
    matches!(
        (input, output),
        (PixelFormat::Yuv420, PixelFormat::Yuv420)
            | (PixelFormat::Yuv420, PixelFormat::Blob)
            | (PixelFormat::Raw16, PixelFormat::Raw16)
    )
}

/// The simulated sensor and its capture task.
pub struct SensorSimulator {
    shared: Arc<SensorShared>,
    task: Option<JoinHandle<()>>,
}

impl SensorSimulator {
    /// Starts the capture loop for a configured pipeline.
    ///
    /// `streams` is the accepted configuration keyed by stream id; `seed`
    /// pins the render noise for deterministic tests.
    pub fn start(
        chars: Arc<CameraCharacteristics>,
        streams: HashMap<StreamId, Stream>,
        importer: Arc<dyn BufferImporter>,
        callback: Arc<dyn PipelineCallback>,
        seed: u64,
    ) -> Self {
        let (vsync_tx, _) = watch::channel(0u64);
        let shared = Arc::new(SensorShared {
            chars,
            streams,
            importer,
            callback,
            queue: Mutex::new(VecDeque::new()),
            queue_space: Notify::new(),
            running: AtomicBool::new(true),
            vsync_tx,
        });
        let task = tokio::spawn(capture_loop(shared.clone(), seed));
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Queues one request, waiting for space when the queue is full.
    pub async fn queue_request(&self, request: SensorRequest) -> HalResult<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(HalError::NoInit("sensor stopped".to_string()));
        }
        let depth = self.shared.chars.pipeline.request_queue_depth;
        let deadline = Instant::now() + QUEUE_SPACE_TIMEOUT;
        let mut request = Some(request);
        loop {
            let notified = self.shared.queue_space.notified();
            {
                let mut queue = self.shared.queue.lock();
                if queue.len() < depth {
                    if let Some(request) = request.take() {
                        queue.push_back(request);
                    }
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HalError::TimedOut("sensor queue full".to_string()));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Waits for the next vsync boundary.
    pub async fn wait_for_vsync(&self) -> HalResult<()> {
        let mut rx = self.shared.vsync_tx.subscribe();
        rx.changed()
            .await
            .map_err(|_| HalError::NoInit("sensor stopped".to_string()))
    }

    /// Drains queued requests with terminal errors, then waits out the
    /// in-flight cycle. Already-rendering work is not aborted.
    pub async fn flush(&self) -> HalResult<()> {
        let drained: Vec<SensorRequest> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        self.shared.queue_space.notify_waiters();
        info!(drained = drained.len(), "sensor flush");

        for request in drained {
            fail_request(&self.shared, request, ErrorCode::Request).await;
        }

        // One vsync tick guarantees any in-flight cycle has finished.
        if self.shared.running.load(Ordering::Acquire) {
            let mut rx = self.shared.vsync_tx.subscribe();
            let _ = tokio::time::timeout(FLUSH_CYCLE_TIMEOUT, rx.changed()).await;
        }
        Ok(())
    }

    /// Stops the capture loop and drains anything still queued.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let leftover: Vec<SensorRequest> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        for request in leftover {
            fail_request(&self.shared, request, ErrorCode::Request).await;
        }
    }
}

/// Sends the terminal error for a request the sensor will not capture.
async fn fail_request(shared: &Arc<SensorShared>, request: SensorRequest, code: ErrorCode) {
    shared
        .callback
        .notify(
            request.pipeline_id,
            NotifyMessage::Error {
                frame_number: request.frame_number,
                stream_id: None,
                code,
            },
        )
        .await;
    let mut result = request.result;
    result.input_buffers = request.input_buffers;
    result.output_buffers = request.output_buffers;
    for buffer in result
        .output_buffers
        .iter_mut()
        .chain(result.input_buffers.iter_mut())
    {
        buffer.status = BufferStatus::Error;
    }
    shared.callback.process_pipeline_result(result).await;
}

async fn capture_loop(shared: Arc<SensorShared>, seed: u64) {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
    let scene = Scene::new(shared.chars.sensor.width, shared.chars.sensor.height);
    let base = Instant::now();
    let default_duration = shared.chars.default_frame_duration();
    let threshold =
        Duration::from_nanos(shared.chars.pipeline.return_result_threshold_ns.max(0) as u64);
    let mut cycle: u64 = 0;

    debug!(camera_id = shared.chars.camera_id, "capture loop started");
    while shared.running.load(Ordering::Acquire) {
        let cycle_start = Instant::now();
        let request = {
            let mut queue = shared.queue.lock();
            queue.pop_front()
        };
        if request.is_some() {
            shared.queue_space.notify_waiters();
        }

        let frame_duration = match &request {
            Some(req) => req
                .settings
                .get(shared.chars.camera_id)
                .map(|s| Duration::from_nanos(s.frame_duration_ns.max(0) as u64))
                .unwrap_or(default_duration),
            None => default_duration,
        };

        if let Some(request) = request {
            let timestamp_ns = base.elapsed().as_nanos() as i64;
            capture_one(&shared, &scene, &mut rng, request, timestamp_ns).await;
        }

        cycle += 1;
        let _ = shared.vsync_tx.send(cycle);

        let deadline = cycle_start + frame_duration;
        let now = Instant::now();
        if now < deadline {
            tokio::time::sleep_until(deadline).await;
        } else if now.duration_since(deadline) > threshold {
            // Overran the frame badly; skip the blank entirely rather than
            // compounding drift.
            warn!(cycle, "capture cycle overran frame duration");
        }
    }
    debug!(camera_id = shared.chars.camera_id, "capture loop stopped");
}

async fn capture_one(
    shared: &Arc<SensorShared>,
    scene: &Scene,
    rng: &mut rand_chacha::ChaCha8Rng,
    mut request: SensorRequest,
    now_ns: i64,
) {
    let is_reprocess = !request.input_buffers.is_empty();
    let timestamp_ns = if is_reprocess {
        request.reprocess_timestamp_ns.unwrap_or(now_ns)
    } else {
        now_ns
    };

    shared
        .callback
        .notify(
            request.pipeline_id,
            NotifyMessage::Shutter {
                frame_number: request.frame_number,
                timestamp_ns,
            },
        )
        .await;

    let settings = request
        .settings
        .get(shared.chars.camera_id)
        .copied()
        .unwrap_or_else(|| {
            warn!(
                frame_number = request.frame_number,
                "request missing settings for the logical device"
            );
            crate::hwl::request_state::SensorSettings {
                exposure_time_ns: 33_333_333,
                frame_duration_ns: 33_333_333,
                sensitivity: shared.chars.sensor.sensitivity_range.min,
                lens_shading_map_mode: 0,
                edge_mode: 0,
                video_stabilization_mode: 0,
                zoom_ratio: 1.0,
                report_noise_profile: false,
            }
        });
    let params = RenderParams {
        exposure_ns: settings.exposure_time_ns,
        sensitivity: settings.sensitivity,
        timestamp_ns,
    };

    let mut rendered_any = false;
    let mut outputs = std::mem::take(&mut request.output_buffers);
    for buffer in &mut outputs {
        if buffer.is_placeholder() {
            // Buffer management path: pull a real buffer from the HAL.
            match shared
                .callback
                .request_stream_buffers(buffer.stream_id, 1)
                .await
            {
                Ok(mut fetched) if !fetched.is_empty() => *buffer = fetched.remove(0),
                other => {
                    warn!(
                        frame_number = request.frame_number,
                        stream_id = buffer.stream_id,
                        failed = other.is_err(),
                        "buffer acquisition failed"
                    );
                    buffer.status = BufferStatus::Error;
                    shared
                        .callback
                        .notify(
                            request.pipeline_id,
                            NotifyMessage::Error {
                                frame_number: request.frame_number,
                                stream_id: Some(buffer.stream_id),
                                code: ErrorCode::Buffer,
                            },
                        )
                        .await;
                    continue;
                }
            }
        }
        if buffer.acquire_fence.wait().is_err() {
            warn!(
                frame_number = request.frame_number,
                stream_id = buffer.stream_id,
                "acquire fence failed"
            );
            buffer.status = BufferStatus::Error;
            continue;
        }
        let rendered = if is_reprocess {
            reprocess_into(shared, &request.input_buffers[0], buffer)
        } else {
            render_into(shared, scene, rng, params, buffer)
        };
        match rendered {
            Ok(()) => {
                buffer.status = BufferStatus::Ok;
                buffer.release_fence = crate::types::Fence::Signaled;
                rendered_any = true;
            }
            Err(err) => {
                // Individual buffer failure; siblings carry on.
                error!(
                    frame_number = request.frame_number,
                    stream_id = buffer.stream_id,
                    %err,
                    "buffer capture failed"
                );
                buffer.status = BufferStatus::Error;
                shared
                    .callback
                    .notify(
                        request.pipeline_id,
                        NotifyMessage::Error {
                            frame_number: request.frame_number,
                            stream_id: Some(buffer.stream_id),
                            code: ErrorCode::Buffer,
                        },
                    )
                    .await;
            }
        }
    }

    let mut result = request.result;
    result.frame_number = request.frame_number;
    result.input_buffers = request.input_buffers;
    result.output_buffers = outputs;
    result
        .result_metadata
        .set_i64(Tag::SensorTimestamp, timestamp_ns);

    if !rendered_any {
        // Nothing usable came out of the cycle; result metadata is lost.
        shared
            .callback
            .notify(
                request.pipeline_id,
                NotifyMessage::Error {
                    frame_number: request.frame_number,
                    stream_id: None,
                    code: ErrorCode::Result,
                },
            )
            .await;
        result.result_metadata = crate::metadata::MetadataStore::new();
    }
    shared.callback.process_pipeline_result(result).await;
}

fn render_into(
    shared: &Arc<SensorShared>,
    scene: &Scene,
    rng: &mut rand_chacha::ChaCha8Rng,
    params: RenderParams,
    buffer: &StreamBuffer,
) -> HalResult<()> {
    let stream = stream_for(shared, buffer, StreamType::Output)?;
    let handle = buffer
        .handle
        .ok_or_else(|| HalError::BadValue("output buffer not imported".to_string()))?;
    let bytes = shared.importer.lock(handle)?;
    let mut data = bytes.lock();
    let needed = scene::required_size(stream.format, stream.width, stream.height);
    if data.len() < needed {
        return Err(HalError::BadValue(format!(
            "stream {} buffer too small: {} < {}",
            stream.id,
            data.len(),
            needed
        )));
    }

    let sensor = &shared.chars.sensor;
    match stream.format {
        PixelFormat::Raw16 => {
            scene::render_raw16(scene, params, sensor, rng, stream.width, stream.height, &mut data);
        }
        PixelFormat::Rgba8888 => {
            scene::render_rgba8888(
                scene, params, sensor, rng, stream.width, stream.height, &mut data,
            );
        }
        PixelFormat::Yuv420 => {
            scene::render_yuv420(
                scene, params, sensor, rng, stream.width, stream.height, &mut data,
            );
        }
        PixelFormat::Depth16 => {
            scene::render_depth16(
                scene, params, sensor, rng, stream.width, stream.height, &mut data,
            );
        }
        PixelFormat::Blob => {
            let payload_len = PixelFormat::Yuv420.buffer_size(stream.width, stream.height);
            let mut payload = vec![0u8; payload_len];
            scene::render_yuv420(
                scene,
                params,
                sensor,
                rng,
                stream.width,
                stream.height,
                &mut payload,
            );
            scene::encode_blob(stream.width, stream.height, &payload, &mut data);
        }
    }
    Ok(())
}

fn reprocess_into(
    shared: &Arc<SensorShared>,
    input: &StreamBuffer,
    output: &StreamBuffer,
) -> HalResult<()> {
    let input_stream = stream_for(shared, input, StreamType::Input)?;
    let output_stream = stream_for(shared, output, StreamType::Output)?;
    if !reprocess_compatible(input_stream.format, output_stream.format) {
        return Err(HalError::BadValue(format!(
            "reprocess {:?} -> {:?} not supported",
            input_stream.format, output_stream.format
        )));
    }

    let input_handle = input
        .handle
        .ok_or_else(|| HalError::BadValue("input buffer not imported".to_string()))?;
    let output_handle = output
        .handle
        .ok_or_else(|| HalError::BadValue("output buffer not imported".to_string()))?;
    let input_bytes = shared.importer.lock(input_handle)?;
    let output_bytes = shared.importer.lock(output_handle)?;
    let source = input_bytes.lock();
    let mut dest = output_bytes.lock();

    match (input_stream.format, output_stream.format) {
        (PixelFormat::Yuv420, PixelFormat::Blob) => {
            // The payload is the nominal YUV image; an allocation may be
            // larger than that, so slice rather than take the whole buffer.
            let payload_len =
                PixelFormat::Yuv420.buffer_size(input_stream.width, input_stream.height);
            if source.len() < payload_len {
                return Err(HalError::BadValue(format!(
                    "yuv input too small: {} < {payload_len}",
                    source.len()
                )));
            }
            let needed = scene::required_size(PixelFormat::Blob, input_stream.width, input_stream.height);
            if dest.len() < needed {
                return Err(HalError::BadValue("blob output too small".to_string()));
            }
            scene::encode_blob(
                input_stream.width,
                input_stream.height,
                &source[..payload_len],
                &mut dest,
            );
        }
        _ => {
            // Same-format path: dimensions must match, bytes carry over.
            if input_stream.width != output_stream.width
                || input_stream.height != output_stream.height
            {
                return Err(HalError::BadValue(
                    "reprocess dimensions mismatch".to_string(),
                ));
            }
            let len = source.len().min(dest.len());
            dest[..len].copy_from_slice(&source[..len]);
        }
    }
    Ok(())
}

fn stream_for<'a>(
    shared: &'a Arc<SensorShared>,
    buffer: &StreamBuffer,
    expected: StreamType,
) -> HalResult<&'a Stream> {
    let stream = shared
        .streams
        .get(&buffer.stream_id)
        .ok_or_else(|| HalError::NotFound(format!("stream {}", buffer.stream_id)))?;
    if stream.stream_type != expected {
        return Err(HalError::BadValue(format!(
            "stream {} has the wrong direction",
            stream.id
        )));
    }
    Ok(stream)
}
