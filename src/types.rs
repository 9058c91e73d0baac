//! Core data types for the capture pipeline.
//!
//! These are the types that cross the two boundaries the HAL mediates: the
//! client-facing session interface (streams, capture requests, results,
//! notify messages) and the hardware-layer interface underneath it. Buffer
//! handles are plain generated integers resolved through
//! [`crate::session::buffer_import::BufferImporter`]; no live references
//! cross a component boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};
use crate::metadata::MetadataStore;

/// Stream identifier assigned by the client.
pub type StreamId = i32;
/// Buffer identifier, unique per stream for the stream's lifetime.
pub type BufferId = u64;
/// Monotonically increasing capture request identifier.
pub type FrameNumber = u32;
/// Camera (logical or physical) identifier.
pub type CameraId = u32;
/// Identifier of a configured hardware pipeline.
pub type PipelineId = u32;

/// Pixel formats understood by the reference pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 16-bit Bayer mosaic.
    Raw16,
    /// Interleaved 8-bit RGBA.
    Rgba8888,
    /// Planar YUV 4:2:0.
    Yuv420,
    /// Opaque compressed container (snapshot path).
    Blob,
    /// 16-bit depth samples.
    Depth16,
}

impl PixelFormat {
    /// Bytes required for one image of `width * height` in this format.
    pub fn buffer_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Raw16 | PixelFormat::Depth16 => pixels * 2,
            PixelFormat::Rgba8888 => pixels * 4,
            PixelFormat::Yuv420 => pixels + pixels / 2,
            // Payload container plus header; callers treat this as a maximum.
            PixelFormat::Blob => pixels + pixels / 2 + BLOB_HEADER_SIZE,
        }
    }
}

/// Size of the self-describing header prefixed to BLOB payloads.
pub const BLOB_HEADER_SIZE: usize = 16;

/// Direction of a stream relative to the HAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// HAL fills buffers, client consumes them.
    Output,
    /// Client supplies filled buffers for reprocessing.
    Input,
}

/// Client-requested rotation applied during capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRotation {
    /// No rotation.
    #[default]
    Rotation0,
    /// 90 degrees clockwise.
    Rotation90,
    /// 180 degrees.
    Rotation180,
    /// 270 degrees clockwise.
    Rotation270,
}

/// A single stream as declared by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Client-assigned stream id, unique within a configuration.
    pub id: StreamId,
    /// Input or output.
    pub stream_type: StreamType,
    /// Requested pixel format.
    pub format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Client usage bits (opaque to the pipeline, negotiated into HalStream).
    pub usage: u64,
    /// Rotation to apply during capture.
    pub rotation: StreamRotation,
    /// Physical camera this stream is bound to, if any.
    pub physical_camera_id: Option<CameraId>,
}

impl Stream {
    /// Bytes required for one buffer of this stream.
    pub fn buffer_size(&self) -> usize {
        self.format.buffer_size(self.width, self.height)
    }
}

/// The full set of streams for one configured pipeline.
///
/// Immutable once accepted by `configure_streams`; superseded wholesale on
/// reconfiguration.
#[derive(Clone, Debug, Default)]
pub struct StreamConfiguration {
    /// All streams, inputs and outputs.
    pub streams: Vec<Stream>,
    /// Optional session-wide parameters.
    pub session_params: Option<MetadataStore>,
}

impl StreamConfiguration {
    /// Looks up a stream by id.
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == id)
    }
}

/// The HAL's accepted version of a [`Stream`].
///
/// One per accepted stream; lives as long as the configured pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HalStream {
    /// Id of the stream this was negotiated from.
    pub id: StreamId,
    /// Format the pipeline will actually produce.
    pub override_format: PixelFormat,
    /// Usage bits granted to the producer side.
    pub producer_usage: u64,
    /// Usage bits granted to the consumer side.
    pub consumer_usage: u64,
    /// Maximum buffers of this stream the pipeline can hold in flight.
    pub max_buffers: u32,
    /// Whether this stream is bound to a physical camera.
    pub is_physical: bool,
    /// The bound physical camera, if `is_physical`.
    pub physical_camera_id: Option<CameraId>,
}

/// Terminal status of a buffer returned to the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferStatus {
    /// Buffer contains valid image data.
    #[default]
    Ok,
    /// Buffer content is undefined; the client must not consume it.
    Error,
}

/// Client-side buffer identity, before import.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawBufferHandle(pub u64);

/// HAL-side handle for an imported buffer, issued by a `BufferImporter`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImportedHandle(pub u64);

/// Synchronization fence state.
///
/// Models the acquire/release fences of the wire protocol as resolved
/// values: the fence either signals cleanly or reports failure. The HAL owns
/// setting release fences while a buffer is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fence {
    /// No fence attached; the buffer is immediately usable.
    #[default]
    None,
    /// Fence has signaled; the buffer is usable.
    Signaled,
    /// Fence reported an error; the buffer must not be touched.
    Error,
}

impl Fence {
    /// Waits for the fence. Resolved-value model, so this never blocks.
    pub fn wait(self) -> HalResult<()> {
        match self {
            Fence::None | Fence::Signaled => Ok(()),
            Fence::Error => Err(HalError::Unknown("acquire fence failed".to_string())),
        }
    }
}

/// One buffer attached to a request or result.
///
/// Ownership: the client owns the buffer before submission; the HAL owns it
/// exclusively while in flight (including responsibility for `status` and
/// `release_fence`); ownership returns to the client on result or notify.
#[derive(Clone, Debug, Default)]
pub struct StreamBuffer {
    /// Stream this buffer belongs to.
    pub stream_id: StreamId,
    /// Buffer identity within the stream.
    pub buffer_id: BufferId,
    /// Client-side handle as submitted; `None` once stripped after import.
    pub raw_handle: Option<RawBufferHandle>,
    /// Imported handle, populated by the session before forwarding.
    pub handle: Option<ImportedHandle>,
    /// Fence the HAL must wait on before touching the buffer.
    pub acquire_fence: Fence,
    /// Fence the HAL sets before returning the buffer.
    pub release_fence: Fence,
    /// Terminal status.
    pub status: BufferStatus,
}

impl StreamBuffer {
    /// A placeholder carries no buffer at all: the hardware layer pulls a
    /// real one on demand through the buffer management path.
    pub fn is_placeholder(&self) -> bool {
        self.buffer_id == 0 && self.raw_handle.is_none() && self.handle.is_none()
    }

    /// Builds a placeholder for `stream_id`.
    pub fn placeholder(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            ..Self::default()
        }
    }
}

/// A single capture request as submitted by the client.
///
/// Consumed exactly once by the pipeline; its buffers transition ownership
/// into flight on acceptance.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    /// Unique, monotonically increasing frame number.
    pub frame_number: FrameNumber,
    /// Per-frame settings; `None` reuses the last valid settings.
    pub settings: Option<MetadataStore>,
    /// At most one input buffer (reprocess path).
    pub input_buffers: Vec<StreamBuffer>,
    /// One or more output buffers.
    pub output_buffers: Vec<StreamBuffer>,
    /// Per-physical-camera settings overrides.
    pub physical_camera_settings: HashMap<CameraId, MetadataStore>,
}

/// A capture result delivered to the client.
#[derive(Clone, Debug, Default)]
pub struct CaptureResult {
    /// Frame this result belongs to.
    pub frame_number: FrameNumber,
    /// Result metadata; present once per frame on the final result.
    pub result_metadata: Option<MetadataStore>,
    /// Returned input buffers (reprocess path).
    pub input_buffers: Vec<StreamBuffer>,
    /// Returned output buffers.
    pub output_buffers: Vec<StreamBuffer>,
    /// Per-physical-camera result metadata.
    pub physical_metadata: HashMap<CameraId, MetadataStore>,
    /// Monotonic partial-result counter; the reference pipeline always
    /// reports 1 (no partial results).
    pub partial_result: u32,
}

/// Asynchronous error classes delivered through `notify`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The device is no longer usable.
    Device,
    /// The whole request failed; terminal for the frame.
    Request,
    /// Result metadata for the frame is lost; buffers may still return.
    Result,
    /// A single buffer failed; does not suppress the eventual result.
    Buffer,
}

/// Message delivered through the client's `notify` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyMessage {
    /// Start of exposure for a frame.
    Shutter {
        /// Frame the shutter belongs to.
        frame_number: FrameNumber,
        /// Sensor timestamp, monotonic nanoseconds.
        timestamp_ns: i64,
    },
    /// Asynchronous error.
    Error {
        /// Frame the error belongs to.
        frame_number: FrameNumber,
        /// Stream involved, for `ErrorCode::Buffer` only.
        stream_id: Option<StreamId>,
        /// Error class.
        code: ErrorCode,
    },
}

impl NotifyMessage {
    /// Frame number carried by this message.
    pub fn frame_number(&self) -> FrameNumber {
        match self {
            NotifyMessage::Shutter { frame_number, .. } => *frame_number,
            NotifyMessage::Error { frame_number, .. } => *frame_number,
        }
    }
}

/// Request templates for default settings construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestTemplate {
    /// Continuous viewfinder.
    Preview,
    /// Single high-quality capture.
    StillCapture,
    /// Continuous recording.
    VideoRecord,
    /// Still capture while recording.
    VideoSnapshot,
    /// Zero-shutter-lag reprocessing.
    ZeroShutterLag,
    /// Fully manual sensor control.
    Manual,
}

/// Usage bit marking a stream as a video encoder consumer.
pub const USAGE_VIDEO_ENCODER: u64 = 1 << 16;
