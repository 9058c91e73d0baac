//! Hardware layer boundary.
//!
//! The session drives a vendor pipeline through [`DeviceSessionHwl`] and the
//! pipeline talks back through [`PipelineCallback`]. Both sides are traits so
//! the session never depends on a concrete hardware stack; the in-tree
//! [`simulated`] implementation is the reference vendor layer.
//!
//! Callbacks are injected once at pipeline configuration time. The callback
//! object must not hold the session alive; the session hands the pipeline a
//! router over its shared state instead of itself.

pub mod request_state;
pub mod scene;
pub mod sensor;
pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BufferRequestError, HalResult};
use crate::metadata::MetadataStore;
use crate::types::{
    CameraId, CaptureRequest, FrameNumber, HalStream, NotifyMessage, PipelineId,
    RequestTemplate, StreamBuffer, StreamConfiguration, StreamId,
};

/// Result emitted by the hardware layer for one processed request.
#[derive(Clone, Debug, Default)]
pub struct HwlPipelineResult {
    /// Device that produced the result.
    pub camera_id: CameraId,
    /// Pipeline the request was submitted on.
    pub pipeline_id: PipelineId,
    /// Frame the result belongs to.
    pub frame_number: FrameNumber,
    /// Result metadata.
    pub result_metadata: MetadataStore,
    /// Returned input buffers.
    pub input_buffers: Vec<StreamBuffer>,
    /// Returned output buffers.
    pub output_buffers: Vec<StreamBuffer>,
    /// Per-physical-device result metadata.
    pub physical_camera_results: HashMap<CameraId, MetadataStore>,
    /// Partial result counter; the reference pipeline always reports 1.
    pub partial_result: u32,
}

/// Upward path from the hardware layer into the session.
#[async_trait]
pub trait PipelineCallback: Send + Sync {
    /// Delivers a pipeline result.
    async fn process_pipeline_result(&self, result: HwlPipelineResult);

    /// Delivers a shutter or error notification.
    async fn notify(&self, pipeline_id: PipelineId, message: NotifyMessage);

    /// Pulls output buffers on demand (HAL buffer management).
    async fn request_stream_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError>;

    /// Pushes unused buffers back.
    async fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>);
}

/// Vendor hardware layer behind one device session.
#[async_trait]
pub trait DeviceSessionHwl: Send + Sync {
    /// Device id this layer serves.
    fn camera_id(&self) -> CameraId;

    /// Whether the stream combination can be configured at all.
    fn is_stream_combination_supported(&self, config: &StreamConfiguration) -> bool;

    /// Configures a pipeline for `config`, wiring `callback` for the upward
    /// path. Returns the pipeline id and the negotiated streams.
    async fn configure_pipeline(
        &mut self,
        config: &StreamConfiguration,
        callback: Arc<dyn PipelineCallback>,
    ) -> HalResult<(PipelineId, Vec<HalStream>)>;

    /// Finalizes configured pipelines and starts capture.
    async fn build_pipelines(&mut self) -> HalResult<()>;

    /// Submits requests to a built pipeline.
    async fn submit_requests(
        &mut self,
        pipeline_id: PipelineId,
        requests: Vec<CaptureRequest>,
    ) -> HalResult<()>;

    /// Drains all in-flight work; every outstanding frame reaches a terminal
    /// notification before this returns.
    async fn flush(&mut self) -> HalResult<()>;

    /// Tears down pipelines and stops capture.
    async fn destroy_pipelines(&mut self);

    /// Builds default request settings for `template`.
    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> HalResult<MetadataStore>;
}
