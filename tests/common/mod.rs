//! Shared harness for session integration tests.
//!
//! `TestClient` plays the camera service: it owns per-stream buffer pools
//! backed by a [`BufferWarehouse`] and records every result and notification
//! in arrival order so tests can assert on interleaving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use camera_hal::config::default_characteristics;
use camera_hal::error::BufferRequestError;
use camera_hal::hwl::simulated::SimulatedCameraHwl;
use camera_hal::session::buffer_import::{BufferImporter, BufferWarehouse};
use camera_hal::session::{CameraDeviceCallback, CameraDeviceSession};
use camera_hal::types::{
    BufferStatus, CaptureResult, FrameNumber, NotifyMessage, PixelFormat, Stream, StreamBuffer,
    StreamConfiguration, StreamId, StreamRotation, StreamType,
};

/// Everything the session sent us, in arrival order.
#[derive(Clone, Debug)]
pub enum Event {
    Result(CaptureResult),
    Notify(NotifyMessage),
}

struct Pool {
    buffer_bytes: usize,
    next_buffer_id: u64,
    free: Vec<StreamBuffer>,
}

pub struct TestClient {
    warehouse: Arc<BufferWarehouse>,
    pools: Mutex<HashMap<StreamId, Pool>>,
    events: Mutex<Vec<Event>>,
    changed: Notify,
    refuse_buffer_requests: AtomicBool,
}

impl TestClient {
    pub fn new(warehouse: Arc<BufferWarehouse>) -> Self {
        Self {
            warehouse,
            pools: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            changed: Notify::new(),
            refuse_buffer_requests: AtomicBool::new(false),
        }
    }

    pub fn register_stream(&self, stream: &Stream) {
        self.pools.lock().insert(
            stream.id,
            Pool {
                buffer_bytes: stream.format.buffer_size(stream.width, stream.height),
                next_buffer_id: 1,
                free: Vec::new(),
            },
        );
    }

    /// Makes `request_stream_buffers` fail with `NoBufferAvailable`.
    pub fn refuse_buffer_requests(&self, refuse: bool) {
        self.refuse_buffer_requests.store(refuse, Ordering::Relaxed);
    }

    /// A fresh or recycled buffer for `stream_id`, ready to submit.
    pub fn buffer(&self, stream_id: StreamId) -> StreamBuffer {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&stream_id).expect("stream registered");
        if let Some(mut buffer) = pool.free.pop() {
            buffer.status = BufferStatus::Ok;
            return buffer;
        }
        let raw = self.warehouse.allocate(pool.buffer_bytes);
        let buffer_id = pool.next_buffer_id;
        pool.next_buffer_id += 1;
        StreamBuffer {
            stream_id,
            buffer_id,
            raw_handle: Some(raw),
            ..StreamBuffer::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn results(&self) -> Vec<CaptureResult> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Result(result) => Some(result.clone()),
                Event::Notify(_) => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<NotifyMessage> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Notify(message) => Some(message.clone()),
                Event::Result(_) => None,
            })
            .collect()
    }

    /// Results carrying metadata, i.e. successful frames.
    pub fn metadata_results(&self) -> Vec<CaptureResult> {
        self.results()
            .into_iter()
            .filter(|r| r.result_metadata.is_some())
            .collect()
    }

    /// Error notifications for `frame_number`.
    pub fn errors_for(&self, frame_number: FrameNumber) -> Vec<NotifyMessage> {
        self.notifications()
            .into_iter()
            .filter(|m| {
                matches!(m, NotifyMessage::Error { frame_number: f, .. } if *f == frame_number)
            })
            .collect()
    }

    /// Waits up to ten seconds for `pred` over the recorded events.
    pub async fn wait_until<F>(&self, pred: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let notified = self.changed.notified();
            if pred(&self.events.lock()) {
                return;
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("condition not met within deadline");
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Waits until `frame_number` has a terminal signal: a metadata result
    /// or a request error.
    pub async fn wait_for_terminal(&self, frame_number: FrameNumber) {
        self.wait_until(move |events| {
            events.iter().any(|e| match e {
                Event::Result(r) => r.frame_number == frame_number && r.result_metadata.is_some(),
                Event::Notify(NotifyMessage::Error {
                    frame_number: f, ..
                }) => *f == frame_number,
                Event::Notify(_) => false,
            })
        })
        .await;
    }

    fn recycle(&self, buffers: Vec<StreamBuffer>) {
        let mut pools = self.pools.lock();
        for buffer in buffers {
            // Errored placeholders come back with no backing handle; pooling
            // them would hand an un-importable buffer to a later fetch.
            if buffer.raw_handle.is_none() {
                continue;
            }
            if let Some(pool) = pools.get_mut(&buffer.stream_id) {
                pool.free.push(buffer);
            }
        }
    }
}

#[async_trait]
impl CameraDeviceCallback for TestClient {
    async fn process_capture_result(&self, result: CaptureResult) {
        let mut buffers = result.output_buffers.clone();
        buffers.extend(result.input_buffers.clone());
        self.recycle(buffers);
        self.events.lock().push(Event::Result(result));
        self.changed.notify_waiters();
    }

    async fn notify(&self, message: NotifyMessage) {
        self.events.lock().push(Event::Notify(message));
        self.changed.notify_waiters();
    }

    async fn request_stream_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
        if self.refuse_buffer_requests.load(Ordering::Relaxed) {
            return Err(BufferRequestError::NoBufferAvailable);
        }
        Ok((0..count).map(|_| self.buffer(stream_id)).collect())
    }

    async fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>) {
        self.recycle(buffers);
    }
}

pub fn output_stream(id: StreamId, format: PixelFormat) -> Stream {
    Stream {
        id,
        stream_type: StreamType::Output,
        format,
        width: 640,
        height: 480,
        usage: 0,
        rotation: StreamRotation::Rotation0,
        physical_camera_id: None,
    }
}

pub fn input_stream(id: StreamId, format: PixelFormat) -> Stream {
    Stream {
        stream_type: StreamType::Input,
        ..output_stream(id, format)
    }
}

/// Builds a configured session over the simulated sensor with a pinned seed.
pub async fn build_session(
    streams: Vec<Stream>,
    seed: u64,
) -> (Arc<CameraDeviceSession>, Arc<TestClient>, Arc<BufferWarehouse>) {
    let chars = default_characteristics(0);
    let warehouse = Arc::new(BufferWarehouse::new());
    let importer: Arc<dyn BufferImporter> = warehouse.clone();
    let client = Arc::new(TestClient::new(warehouse.clone()));
    for stream in &streams {
        client.register_stream(stream);
    }

    let hwl = SimulatedCameraHwl::with_rng_seed(chars, importer.clone(), seed)
        .expect("simulated hardware layer");
    let session = CameraDeviceSession::new(Box::new(hwl), client.clone(), importer);
    session
        .configure_streams(StreamConfiguration {
            streams,
            session_params: None,
        })
        .await
        .expect("stream configuration");
    (session, client, warehouse)
}
