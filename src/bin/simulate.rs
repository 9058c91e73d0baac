//! Run a short capture session against the simulated sensor.
//!
//! Stands in for a camera service client: configures a preview stream plus a
//! JPEG-style snapshot stream, submits a few dozen requests, takes one still,
//! then flushes and closes. `RUST_LOG=debug` shows the per-frame pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use camera_hal::config::default_characteristics;
use camera_hal::error::BufferRequestError;
use camera_hal::metadata::Tag;
use camera_hal::session::buffer_import::{BufferImporter, BufferWarehouse};
use camera_hal::session::{CameraDeviceCallback, CameraDeviceSession};
use camera_hal::types::{
    BufferStatus, CaptureRequest, CaptureResult, NotifyMessage, PixelFormat, RequestTemplate,
    Stream, StreamBuffer, StreamConfiguration, StreamId, StreamRotation, StreamType,
};

/// Client-side buffer pools and result accounting.
struct DemoClient {
    warehouse: Arc<BufferWarehouse>,
    pools: Mutex<HashMap<StreamId, Pool>>,
    shutters: AtomicU64,
    results: AtomicU64,
    errors: AtomicU64,
}

struct Pool {
    buffer_bytes: usize,
    next_buffer_id: u64,
    free: Vec<StreamBuffer>,
}

impl DemoClient {
    fn new(warehouse: Arc<BufferWarehouse>) -> Self {
        Self {
            warehouse,
            pools: Mutex::new(HashMap::new()),
            shutters: AtomicU64::new(0),
            results: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn add_pool(&self, stream: &Stream) {
        self.pools.lock().insert(
            stream.id,
            Pool {
                buffer_bytes: stream.format.buffer_size(stream.width, stream.height),
                next_buffer_id: 1,
                free: Vec::new(),
            },
        );
    }

    fn take_buffer(&self, stream_id: StreamId) -> StreamBuffer {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(&stream_id)
            .expect("stream pool registered before use");
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

    fn recycle(&self, buffers: Vec<StreamBuffer>) {
        let mut pools = self.pools.lock();
        for buffer in buffers {
            if let Some(pool) = pools.get_mut(&buffer.stream_id) {
                pool.free.push(buffer);
            }
        }
    }
}

#[async_trait]
impl CameraDeviceCallback for DemoClient {
    async fn process_capture_result(&self, result: CaptureResult) {
        if result.result_metadata.is_some() {
            self.results.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metadata) = &result.result_metadata {
            debug!(
                frame = result.frame_number,
                timestamp_ns = metadata.get_i64(Tag::SensorTimestamp),
                buffers = result.output_buffers.len(),
                "capture result"
            );
        }
        let mut buffers = result.output_buffers;
        buffers.extend(result.input_buffers);
        self.recycle(buffers);
    }

    async fn notify(&self, message: NotifyMessage) {
        match message {
            NotifyMessage::Shutter { .. } => {
                self.shutters.fetch_add(1, Ordering::Relaxed);
            }
            NotifyMessage::Error {
                frame_number, code, ..
            } => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                info!(frame_number, ?code, "error notification");
            }
        }
    }

    async fn request_stream_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
        Ok((0..count).map(|_| self.take_buffer(stream_id)).collect())
    }

    async fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>) {
        self.recycle(buffers);
    }
}

fn output_stream(id: StreamId, format: PixelFormat, width: u32, height: u32) -> Stream {
    Stream {
        id,
        stream_type: StreamType::Output,
        format,
        width,
        height,
        usage: 0,
        rotation: StreamRotation::Rotation0,
        physical_camera_id: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let chars = default_characteristics(0);
    let warehouse = Arc::new(BufferWarehouse::new());
    let importer: Arc<dyn BufferImporter> = warehouse.clone();
    let client = Arc::new(DemoClient::new(warehouse.clone()));

    let hwl = camera_hal::hwl::simulated::SimulatedCameraHwl::new(chars.clone(), importer.clone())?;
    let session = CameraDeviceSession::new(Box::new(hwl), client.clone(), importer);

    let preview = output_stream(0, PixelFormat::Yuv420, 640, 480);
    let snapshot = output_stream(1, PixelFormat::Blob, 640, 480);
    client.add_pool(&preview);
    client.add_pool(&snapshot);
    let hal_streams = session
        .configure_streams(StreamConfiguration {
            streams: vec![preview, snapshot],
            session_params: None,
        })
        .await?;
    info!(streams = hal_streams.len(), "session configured");

    let preview_settings = session
        .default_request_settings(RequestTemplate::Preview)
        .await?;
    let still_settings = session
        .default_request_settings(RequestTemplate::StillCapture)
        .await?;

    let mut submitted = 0usize;
    for frame_number in 0..30u32 {
        let mut request = CaptureRequest {
            frame_number,
            settings: (frame_number == 0).then(|| preview_settings.clone()),
            output_buffers: vec![client.take_buffer(0)],
            ..CaptureRequest::default()
        };
        // Frame 15 is the still: snapshot buffer alongside the preview one.
        if frame_number == 15 {
            request.settings = Some(still_settings.clone());
            request.output_buffers.push(client.take_buffer(1));
        }
        submitted += session.process_capture_request(vec![request]).await?;
    }

    session.flush().await?;
    session.close().await;

    let snap = session.telemetry().snapshot();
    println!("submitted {submitted} requests");
    println!(
        "shutters={} results={} errors={}",
        client.shutters.load(Ordering::Relaxed),
        client.results.load(Ordering::Relaxed),
        client.errors.load(Ordering::Relaxed)
    );
    println!(
        "telemetry: accepted={} delivered={} errored={} flushes={}",
        snap.requests_accepted, snap.results_delivered, snap.frames_errored, snap.flushes
    );
    Ok(())
}
