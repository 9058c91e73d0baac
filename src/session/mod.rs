//! Device session: the client-facing capture orchestrator.
//!
//! [`CameraDeviceSession`] validates and imports capture requests, admits
//! them against the pipeline's buffer budgets, forwards them to the hardware
//! layer, and demultiplexes the asynchronous results and notifications back
//! to the client. Per-frame bookkeeping guarantees exactly one terminal
//! signal per frame: either its results or a single request-level error.
//!
//! Locking: the session mutex serializes stream configuration and request
//! submission. Flush runs without it, because submission can be parked inside
//! the admission wait; flush clears the tracker to wake it and the flushing
//! flag is re-checked on the far side of the wait.

pub mod buffer_cache;
pub mod buffer_import;
pub mod tracker;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{BufferRequestError, HalError, HalResult};
use crate::hwl::{DeviceSessionHwl, HwlPipelineResult, PipelineCallback};
use crate::metadata::{capture_intent, switch_mode, MetadataStore, Tag};
use crate::session::buffer_cache::{
    BufferRequestClient, StreamBufferCacheManager, DEFAULT_FETCH_TIMEOUT,
};
use crate::session::buffer_import::{BufferImporter, HandleMap};
use crate::session::tracker::{PendingRequestsTracker, DEFAULT_ADMISSION_TIMEOUT};
use crate::telemetry::SessionTelemetry;
use crate::thermal::{ThermalMonitor, ThrottleSeverity};
use crate::types::{
    BufferId, BufferStatus, CaptureRequest, CaptureResult, ErrorCode, FrameNumber, HalStream,
    NotifyMessage, PipelineId, PixelFormat, RequestTemplate, Stream, StreamBuffer,
    StreamConfiguration, StreamId, StreamType, USAGE_VIDEO_ENCODER,
};

/// Client side of a device session.
#[async_trait]
pub trait CameraDeviceCallback: Send + Sync {
    /// Delivers a capture result.
    async fn process_capture_result(&self, result: CaptureResult);

    /// Delivers a shutter or error notification.
    async fn notify(&self, message: NotifyMessage);

    /// Supplies buffers for the HAL buffer management path.
    async fn request_stream_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError>;

    /// Takes back buffers the HAL no longer needs.
    async fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>);
}

#[derive(Default)]
struct RequestRecords {
    /// Streams each frame still has buffers outstanding on.
    pending_request_streams: HashMap<FrameNumber, HashSet<StreamId>>,
    /// Frames already sent a request-level error. At most one per frame.
    error_notified_requests: HashSet<FrameNumber>,
    /// Frames whose result metadata was lost to a result error.
    metadata_lost: HashSet<FrameNumber>,
}

/// State shared between the session and the pipeline's result path.
///
/// The hardware layer holds this through [`ResultRouter`], never the session
/// itself, so teardown cannot cycle.
struct SharedPipeline {
    client: Arc<dyn CameraDeviceCallback>,
    telemetry: Arc<SessionTelemetry>,
    handle_map: HandleMap,
    records: Mutex<RequestRecords>,
    tracker: RwLock<Option<Arc<PendingRequestsTracker>>>,
    cache: RwLock<Option<Arc<StreamBufferCacheManager>>>,
    configured_streams: RwLock<HashMap<StreamId, Stream>>,
    /// Buffers obtained through the buffer management path, keyed by
    /// `(stream, buffer)`, so returns release the right budget.
    acquired_buffers: Mutex<HashSet<(StreamId, BufferId)>>,
    is_flushing: AtomicBool,
    flush_done: tokio::sync::Notify,
}

impl SharedPipeline {
    fn tracker(&self) -> Option<Arc<PendingRequestsTracker>> {
        self.tracker.read().clone()
    }

    fn cache(&self) -> Option<Arc<StreamBufferCacheManager>> {
        self.cache.read().clone()
    }

    fn reset_pipeline_state(&self) {
        *self.tracker.write() = None;
        *self.cache.write() = None;
        self.configured_streams.write().clear();
        let mut records = self.records.lock();
        records.pending_request_streams.clear();
        records.error_notified_requests.clear();
        records.metadata_lost.clear();
        self.acquired_buffers.lock().clear();
    }

    fn forget_frame(&self, frame_number: FrameNumber) {
        self.records
            .lock()
            .pending_request_streams
            .remove(&frame_number);
    }

    /// Sends the exactly-once request-level error for a frame and returns
    /// its buffers to the client with error status.
    async fn synthesize_request_error(&self, request: CaptureRequest) {
        let frame_number = request.frame_number;
        let already = {
            let mut records = self.records.lock();
            records.pending_request_streams.remove(&frame_number);
            !records.error_notified_requests.insert(frame_number)
        };
        if !already {
            self.client
                .notify(NotifyMessage::Error {
                    frame_number,
                    stream_id: None,
                    code: ErrorCode::Request,
                })
                .await;
            self.telemetry.frame_errored();
        }

        let mut result = CaptureResult {
            frame_number,
            result_metadata: None,
            input_buffers: request.input_buffers,
            output_buffers: request.output_buffers,
            physical_metadata: HashMap::new(),
            partial_result: 0,
        };
        for buffer in result
            .output_buffers
            .iter_mut()
            .chain(result.input_buffers.iter_mut())
        {
            buffer.status = BufferStatus::Error;
        }
        self.client.process_capture_result(result).await;
    }

    async fn handle_result(&self, result: HwlPipelineResult) {
        let frame_number = result.frame_number;
        let (errored, metadata_lost) = {
            let mut records = self.records.lock();
            for buffer in &result.output_buffers {
                if let Some(streams) = records.pending_request_streams.get_mut(&frame_number) {
                    streams.remove(&buffer.stream_id);
                    if streams.is_empty() {
                        records.pending_request_streams.remove(&frame_number);
                    }
                }
            }
            let errored = records.error_notified_requests.contains(&frame_number);
            (errored, records.metadata_lost.remove(&frame_number))
        };

        // Split budget release by how each buffer entered flight.
        let mut acquired_released = Vec::new();
        let mut request_released = Vec::new();
        {
            let mut acquired = self.acquired_buffers.lock();
            for buffer in &result.output_buffers {
                if buffer.is_placeholder() {
                    // A placeholder that never became a real buffer holds no
                    // budget.
                    continue;
                }
                if acquired.remove(&(buffer.stream_id, buffer.buffer_id)) {
                    acquired_released.push(buffer.clone());
                } else {
                    request_released.push(buffer.clone());
                }
            }
        }

        let mut capture_result = CaptureResult {
            frame_number,
            result_metadata: if errored || metadata_lost {
                None
            } else {
                Some(result.result_metadata)
            },
            input_buffers: result.input_buffers,
            output_buffers: result.output_buffers,
            physical_metadata: result.physical_camera_results,
            partial_result: result.partial_result,
        };
        if errored {
            // The frame already got its request error; only the buffers go
            // back, flagged invalid.
            for buffer in &mut capture_result.output_buffers {
                buffer.status = BufferStatus::Error;
            }
        }
        self.client.process_capture_result(capture_result).await;
        if !errored && !metadata_lost {
            self.telemetry.result_delivered();
        }

        if let Some(tracker) = self.tracker() {
            // Caches stay active while the configuration lives; only flush
            // and reconfiguration deactivate them.
            let _ = tracker.track_returned_result_buffers(&request_released);
            tracker.track_returned_acquired_buffers(&acquired_released);
        }
        if let Some(cache) = self.cache() {
            for buffer in &acquired_released {
                cache.mark_delivered(buffer.stream_id);
            }
        }
    }

    async fn handle_notify(&self, message: NotifyMessage) {
        match message {
            NotifyMessage::Shutter { frame_number, .. } => {
                let suppressed = self
                    .records
                    .lock()
                    .error_notified_requests
                    .contains(&frame_number);
                if !suppressed {
                    self.client.notify(message).await;
                }
            }
            NotifyMessage::Error {
                frame_number,
                code: ErrorCode::Request,
                ..
            } => {
                let first = self
                    .records
                    .lock()
                    .error_notified_requests
                    .insert(frame_number);
                if first {
                    self.client.notify(message).await;
                    self.telemetry.frame_errored();
                } else {
                    debug!(frame_number, "duplicate request error suppressed");
                }
            }
            NotifyMessage::Error {
                frame_number,
                code: ErrorCode::Result,
                ..
            } => {
                self.records.lock().metadata_lost.insert(frame_number);
                self.client.notify(message).await;
            }
            NotifyMessage::Error {
                frame_number,
                code: ErrorCode::Buffer,
                ..
            } => {
                let downgraded = self
                    .records
                    .lock()
                    .error_notified_requests
                    .contains(&frame_number);
                if !downgraded {
                    self.client.notify(message).await;
                }
            }
            NotifyMessage::Error { .. } => self.client.notify(message).await,
        }
    }

    async fn acquire_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
        let Some(tracker) = self.tracker() else {
            return Err(BufferRequestError::StreamDisconnected);
        };
        let Some(cache) = self.cache() else {
            return Err(BufferRequestError::StreamDisconnected);
        };
        tracker
            .wait_and_track_acquired_buffers(stream_id, count)
            .await
            .map_err(|err| match err {
                HalError::BadValue(_) => BufferRequestError::StreamDisconnected,
                _ => BufferRequestError::Unknown,
            })?;

        let mut fetched: Vec<StreamBuffer> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match cache.get_buffer(stream_id).await {
                Ok(buffer) => fetched.push(buffer),
                Err(err) => {
                    for buffer in fetched.drain(..) {
                        cache.return_buffer(buffer).await;
                    }
                    tracker.track_buffer_acquisition_failure(stream_id, count);
                    return Err(err);
                }
            }
        }
        if self.handle_map.import_buffers(fetched.iter_mut()).is_err() {
            for buffer in fetched.drain(..) {
                cache.return_buffer(buffer).await;
            }
            tracker.track_buffer_acquisition_failure(stream_id, count);
            return Err(BufferRequestError::Unknown);
        }

        {
            let mut acquired = self.acquired_buffers.lock();
            for buffer in &fetched {
                acquired.insert((buffer.stream_id, buffer.buffer_id));
            }
        }
        self.telemetry.buffer_requested(u64::from(count));
        Ok(fetched)
    }

    async fn give_back_buffers(&self, buffers: Vec<StreamBuffer>) {
        {
            let mut acquired = self.acquired_buffers.lock();
            for buffer in &buffers {
                acquired.remove(&(buffer.stream_id, buffer.buffer_id));
            }
        }
        if let Some(tracker) = self.tracker() {
            tracker.track_returned_acquired_buffers(&buffers);
        }
        if let Some(cache) = self.cache() {
            for buffer in buffers {
                cache.return_buffer(buffer).await;
            }
        }
    }
}

/// The callback object handed to the hardware layer.
struct ResultRouter {
    shared: Arc<SharedPipeline>,
}

#[async_trait]
impl PipelineCallback for ResultRouter {
    async fn process_pipeline_result(&self, result: HwlPipelineResult) {
        self.shared.handle_result(result).await;
    }

    async fn notify(&self, _pipeline_id: PipelineId, message: NotifyMessage) {
        self.shared.handle_notify(message).await;
    }

    async fn request_stream_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
        self.shared.acquire_buffers(stream_id, count).await
    }

    async fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>) {
        self.shared.give_back_buffers(buffers).await;
    }
}

/// Adapter exposing the client callback to the cache manager.
struct ClientBufferSource {
    client: Arc<dyn CameraDeviceCallback>,
}

#[async_trait]
impl BufferRequestClient for ClientBufferSource {
    async fn request_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
        self.client.request_stream_buffers(stream_id, count).await
    }

    async fn return_buffers(&self, buffers: Vec<StreamBuffer>) {
        self.client.return_stream_buffers(buffers).await;
    }
}

struct ThermalState {
    rx: Option<watch::Receiver<ThrottleSeverity>>,
    last_annotated: Option<bool>,
}

/// One open camera device session.
pub struct CameraDeviceSession {
    shared: Arc<SharedPipeline>,
    hwl: tokio::sync::Mutex<Box<dyn DeviceSessionHwl>>,
    /// Serializes configuration and submission. Never held by flush.
    session_lock: tokio::sync::Mutex<()>,
    pipeline_id: Mutex<Option<PipelineId>>,
    has_valid_settings: AtomicBool,
    thermal: Mutex<ThermalState>,
    telemetry: Arc<SessionTelemetry>,
}

impl CameraDeviceSession {
    /// Opens a session over `hwl`, delivering results through `client` and
    /// importing buffers through `importer`.
    pub fn new(
        hwl: Box<dyn DeviceSessionHwl>,
        client: Arc<dyn CameraDeviceCallback>,
        importer: Arc<dyn BufferImporter>,
    ) -> Arc<Self> {
        let telemetry = Arc::new(SessionTelemetry::new(hwl.camera_id()));
        let shared = Arc::new(SharedPipeline {
            client,
            telemetry: telemetry.clone(),
            handle_map: HandleMap::new(importer),
            records: Mutex::new(RequestRecords::default()),
            tracker: RwLock::new(None),
            cache: RwLock::new(None),
            configured_streams: RwLock::new(HashMap::new()),
            acquired_buffers: Mutex::new(HashSet::new()),
            is_flushing: AtomicBool::new(false),
            flush_done: tokio::sync::Notify::new(),
        });
        Arc::new(Self {
            shared,
            hwl: tokio::sync::Mutex::new(hwl),
            session_lock: tokio::sync::Mutex::new(()),
            pipeline_id: Mutex::new(None),
            has_valid_settings: AtomicBool::new(false),
            thermal: Mutex::new(ThermalState {
                rx: None,
                last_annotated: None,
            }),
            telemetry,
        })
    }

    /// Subscribes the session to a thermal monitor. Requests carry a
    /// throttling tag while severity is high.
    pub fn subscribe_thermal(&self, monitor: &ThermalMonitor) {
        let mut thermal = self.thermal.lock();
        thermal.rx = Some(monitor.subscribe());
        thermal.last_annotated = None;
    }

    /// Session telemetry counters.
    pub fn telemetry(&self) -> &SessionTelemetry {
        &self.telemetry
    }

    /// Builds default settings for a template via the hardware layer.
    pub async fn default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> HalResult<MetadataStore> {
        let hwl = self.hwl.lock().await;
        hwl.construct_default_request_settings(template)
    }

    /// Configures the session's streams, replacing any previous pipeline.
    ///
    /// On validation failure the previous configuration stays untouched.
    pub async fn configure_streams(
        &self,
        config: StreamConfiguration,
    ) -> HalResult<Vec<HalStream>> {
        let _guard = self.session_lock.lock().await;
        let mut hwl = self.hwl.lock().await;
        if !hwl.is_stream_combination_supported(&config) {
            return Err(HalError::BadValue(
                "unsupported stream combination".to_string(),
            ));
        }

        hwl.destroy_pipelines().await;
        self.shared.reset_pipeline_state();
        *self.pipeline_id.lock() = None;
        self.has_valid_settings.store(false, Ordering::Release);

        let router = Arc::new(ResultRouter {
            shared: self.shared.clone(),
        });
        let (pipeline_id, mut hal_streams) = hwl.configure_pipeline(&config, router).await?;
        hal_streams.sort_by_key(|s| s.id);

        let tracker = Arc::new(PendingRequestsTracker::new(
            &hal_streams,
            DEFAULT_ADMISSION_TIMEOUT,
        ));
        let cache = Arc::new(StreamBufferCacheManager::new(
            Arc::new(ClientBufferSource {
                client: self.shared.client.clone(),
            }),
            DEFAULT_FETCH_TIMEOUT,
        ));
        for hal_stream in &hal_streams {
            let is_output = config
                .stream(hal_stream.id)
                .is_some_and(|s| s.stream_type == StreamType::Output);
            if is_output {
                cache.register_stream(hal_stream.id, hal_stream.max_buffers)?;
            }
        }

        // Imports belonging to streams dropped by this configuration are
        // stale now.
        let live: Vec<StreamId> = config.streams.iter().map(|s| s.id).collect();
        self.shared.handle_map.retain_streams(&live);

        *self.shared.tracker.write() = Some(tracker);
        *self.shared.cache.write() = Some(cache);
        *self.shared.configured_streams.write() =
            config.streams.iter().map(|s| (s.id, s.clone())).collect();

        if let Err(err) = hwl.build_pipelines().await {
            hwl.destroy_pipelines().await;
            self.shared.reset_pipeline_state();
            return Err(err);
        }
        *self.pipeline_id.lock() = Some(pipeline_id);
        info!(pipeline_id, streams = hal_streams.len(), "streams configured");
        Ok(hal_streams)
    }

    /// Submits capture requests in order, returning how many were accepted.
    ///
    /// Processing stops at the first failure; the client resubmits the rest.
    /// An error is returned only when nothing was processed.
    pub async fn process_capture_request(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> HalResult<usize> {
        let _guard = self.session_lock.lock().await;
        if self.pipeline_id.lock().is_none() {
            return Err(HalError::NoInit("no streams configured".to_string()));
        }

        let mut processed = 0usize;
        let mut failure = None;
        for request in requests {
            let frame_number = request.frame_number;
            match self.process_one(request).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    warn!(frame_number, %err, "capture request rejected");
                    failure = Some(err);
                    break;
                }
            }
        }
        match failure {
            Some(err) if processed == 0 => Err(err),
            _ => Ok(processed),
        }
    }

    async fn process_one(&self, mut request: CaptureRequest) -> HalResult<()> {
        let frame_number = request.frame_number;
        if request.output_buffers.is_empty() {
            return Err(HalError::BadValue(format!(
                "request {frame_number} has no output buffers"
            )));
        }
        if request.input_buffers.len() > 1 {
            return Err(HalError::BadValue(format!(
                "request {frame_number} has more than one input buffer"
            )));
        }
        let intent = {
            let streams = self.shared.configured_streams.read();
            for buffer in request
                .output_buffers
                .iter()
                .chain(request.input_buffers.iter())
            {
                if !streams.contains_key(&buffer.stream_id) {
                    return Err(HalError::BadValue(format!(
                        "request {frame_number} targets unconfigured stream {}",
                        buffer.stream_id
                    )));
                }
            }
            derive_output_intent(&request, &streams)
        };

        match request.settings.as_mut() {
            Some(settings) => {
                if !settings.contains(Tag::ControlCaptureIntent) {
                    settings.set_u8(Tag::ControlCaptureIntent, intent);
                }
                self.annotate_thermal(settings);
                self.has_valid_settings.store(true, Ordering::Release);
            }
            None => {
                if !self.has_valid_settings.load(Ordering::Acquire) {
                    return Err(HalError::BadValue(
                        "first request of a configuration must carry settings".to_string(),
                    ));
                }
            }
        }

        if self.shared.is_flushing.load(Ordering::Acquire) {
            return Err(HalError::Flushing);
        }

        self.shared.handle_map.import_buffers(
            request
                .output_buffers
                .iter_mut()
                .filter(|b| !b.is_placeholder())
                .chain(request.input_buffers.iter_mut()),
        )?;

        {
            let mut records = self.shared.records.lock();
            if records.pending_request_streams.contains_key(&frame_number) {
                return Err(HalError::BadValue(format!(
                    "frame {frame_number} already in flight"
                )));
            }
            let stream_set: HashSet<StreamId> = request
                .output_buffers
                .iter()
                .map(|b| b.stream_id)
                .collect();
            records
                .pending_request_streams
                .insert(frame_number, stream_set);
        }

        let tracker = self
            .shared
            .tracker()
            .ok_or_else(|| HalError::NoInit("no tracker".to_string()))?;
        let cache = self
            .shared
            .cache()
            .ok_or_else(|| HalError::NoInit("no buffer cache".to_string()))?;

        let first_requested = match tracker.wait_and_track_request(&request).await {
            Ok(streams) => streams,
            Err(err) => {
                self.shared.forget_frame(frame_number);
                return Err(err);
            }
        };
        for stream_id in &first_requested {
            cache.notify_provider_readiness(*stream_id);
        }

        // A flush may have started while this request waited for admission.
        if self.shared.is_flushing.load(Ordering::Acquire) {
            let attached: Vec<StreamBuffer> = request
                .output_buffers
                .iter()
                .filter(|b| !b.is_placeholder())
                .cloned()
                .collect();
            tracker.track_returned_result_buffers(&attached);
            tracker.unrequest_streams(&first_requested);
            self.shared.synthesize_request_error(request).await;
            return Ok(());
        }

        // Streams that went idle and got their caches drained cannot serve
        // placeholder buffers anymore; the request fails terminally but
        // still counts as processed.
        let inactive = request
            .output_buffers
            .iter()
            .any(|b| b.is_placeholder() && !cache.is_stream_active(b.stream_id));
        if inactive {
            let attached: Vec<StreamBuffer> = request
                .output_buffers
                .iter()
                .filter(|b| !b.is_placeholder())
                .cloned()
                .collect();
            tracker.track_returned_result_buffers(&attached);
            self.shared.synthesize_request_error(request).await;
            return Ok(());
        }

        let pipeline_id = self
            .pipeline_id
            .lock()
            .ok_or_else(|| HalError::NoInit("no pipeline".to_string()))?;
        let mut hwl = self.hwl.lock().await;
        match hwl.submit_requests(pipeline_id, vec![request.clone()]).await {
            Ok(()) => {
                self.telemetry.request_accepted();
                Ok(())
            }
            Err(err) => {
                let attached: Vec<StreamBuffer> = request
                    .output_buffers
                    .iter()
                    .filter(|b| !b.is_placeholder())
                    .cloned()
                    .collect();
                tracker.track_returned_result_buffers(&attached);
                self.shared.forget_frame(frame_number);
                Err(err)
            }
        }
    }

    /// Drains the whole pipeline. After return every submitted frame has
    /// received a terminal notification and all tracking state is empty.
    ///
    /// Idempotent; a concurrent caller waits for the running flush.
    pub async fn flush(&self) -> HalResult<()> {
        if self.shared.is_flushing.swap(true, Ordering::AcqRel) {
            // Another flush is running; wait it out.
            loop {
                let notified = self.shared.flush_done.notified();
                if !self.shared.is_flushing.load(Ordering::Acquire) {
                    return Ok(());
                }
                let _ = tokio::time::timeout(Duration::from_millis(100), notified).await;
            }
        }
        debug!("flush started");

        {
            let mut hwl = self.hwl.lock().await;
            if let Err(err) = hwl.flush().await {
                warn!(%err, "hardware layer flush failed");
            }
        }

        // Anything still recorded never reached the sensor's drain; give it
        // its terminal error now.
        let leftovers: Vec<FrameNumber> = {
            let records = self.shared.records.lock();
            records
                .pending_request_streams
                .keys()
                .copied()
                .collect()
        };
        for frame_number in leftovers {
            let first = {
                let mut records = self.shared.records.lock();
                records.pending_request_streams.remove(&frame_number);
                records.error_notified_requests.insert(frame_number)
            };
            if first {
                self.shared
                    .client
                    .notify(NotifyMessage::Error {
                        frame_number,
                        stream_id: None,
                        code: ErrorCode::Request,
                    })
                    .await;
                self.telemetry.frame_errored();
            }
        }

        if let Some(tracker) = self.shared.tracker() {
            tracker.clear();
        }
        if let Some(cache) = self.shared.cache() {
            cache.notify_flushing_all().await;
        }
        self.shared.records.lock().pending_request_streams.clear();
        self.shared.acquired_buffers.lock().clear();

        self.telemetry.flushed();
        self.shared.is_flushing.store(false, Ordering::Release);
        self.shared.flush_done.notify_waiters();
        debug!("flush finished");
        Ok(())
    }

    /// Closes the session: drains, tears down the pipeline, frees imports.
    pub async fn close(&self) {
        let _ = self.flush().await;
        let _guard = self.session_lock.lock().await;
        let mut hwl = self.hwl.lock().await;
        hwl.destroy_pipelines().await;
        self.shared.reset_pipeline_state();
        *self.pipeline_id.lock() = None;
        self.shared.handle_map.clear();
        self.telemetry.log_summary();
    }

    fn annotate_thermal(&self, settings: &mut MetadataStore) {
        let mut thermal = self.thermal.lock();
        let Some(rx) = thermal.rx.as_ref() else {
            return;
        };
        let throttled = rx.borrow().throttles();
        let previously = thermal.last_annotated.unwrap_or(false);
        if throttled {
            settings.set_u8(Tag::ThermalThrottling, switch_mode::ON);
        } else if previously {
            // Recovery is announced once; a never-throttled session carries
            // no tag at all.
            settings.set_u8(Tag::ThermalThrottling, switch_mode::OFF);
        }
        thermal.last_annotated = Some(throttled);
    }
}

/// Derives the capture intent implied by a request's target streams.
fn derive_output_intent(request: &CaptureRequest, streams: &HashMap<StreamId, Stream>) -> u8 {
    if !request.input_buffers.is_empty() {
        return capture_intent::ZERO_SHUTTER_LAG;
    }
    let mut video = false;
    let mut still = false;
    for buffer in &request.output_buffers {
        if let Some(stream) = streams.get(&buffer.stream_id) {
            if stream.usage & USAGE_VIDEO_ENCODER != 0 {
                video = true;
            }
            if stream.format == PixelFormat::Blob {
                still = true;
            }
        }
    }
    match (video, still) {
        (true, true) => capture_intent::VIDEO_SNAPSHOT,
        (true, false) => capture_intent::VIDEO_RECORD,
        (false, true) => capture_intent::STILL_CAPTURE,
        (false, false) => capture_intent::PREVIEW,
    }
}
