//! Reference hardware layer: 3A emulation wired to the simulated sensor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::config::{CameraCharacteristics, Capability};
use crate::error::{HalError, HalResult};
use crate::hwl::request_state::{default_request_settings, LogicalRequestState};
use crate::hwl::sensor::{SensorRequest, SensorSimulator};
use crate::hwl::{DeviceSessionHwl, PipelineCallback};
use crate::metadata::{MetadataStore, Tag};
use crate::session::buffer_import::BufferImporter;
use crate::types::{
    CameraId, CaptureRequest, HalStream, PipelineId, PixelFormat, RequestTemplate, Stream,
    StreamConfiguration, StreamId, StreamType,
};

struct ConfiguredPipeline {
    pipeline_id: PipelineId,
    streams: HashMap<StreamId, Stream>,
    callback: Arc<dyn PipelineCallback>,
}

/// Emulated camera hardware behind the [`DeviceSessionHwl`] seam.
pub struct SimulatedCameraHwl {
    chars: Arc<CameraCharacteristics>,
    importer: Arc<dyn BufferImporter>,
    request_state: LogicalRequestState,
    pipeline: Option<ConfiguredPipeline>,
    sensor: Option<SensorSimulator>,
    next_pipeline_id: PipelineId,
    last_settings: Option<MetadataStore>,
    seed: u64,
}

impl SimulatedCameraHwl {
    /// Creates the hardware layer for `chars` with entropy-seeded noise.
    pub fn new(
        chars: Arc<CameraCharacteristics>,
        importer: Arc<dyn BufferImporter>,
    ) -> HalResult<Self> {
        let seed = rand::thread_rng().gen();
        Self::with_rng_seed(chars, importer, seed)
    }

    /// Creates the hardware layer with a pinned noise and 3A seed.
    pub fn with_rng_seed(
        chars: Arc<CameraCharacteristics>,
        importer: Arc<dyn BufferImporter>,
        seed: u64,
    ) -> HalResult<Self> {
        let physical_chars: Vec<Arc<CameraCharacteristics>> = chars
            .physical_camera_ids
            .iter()
            .map(|id| {
                let mut physical = chars.as_ref().clone();
                physical.camera_id = *id;
                physical.physical_camera_ids.clear();
                physical
                    .capabilities
                    .retain(|c| *c != Capability::LogicalMultiCamera);
                Arc::new(physical)
            })
            .collect();
        let request_state =
            LogicalRequestState::with_rng_seed(chars.clone(), physical_chars, seed);
        Ok(Self {
            chars,
            importer,
            request_state,
            pipeline: None,
            sensor: None,
            next_pipeline_id: 0,
            last_settings: None,
            seed,
        })
    }

    fn stream_supported(&self, stream: &Stream) -> bool {
        if stream.width == 0 || stream.height == 0 {
            return false;
        }
        match stream.stream_type {
            StreamType::Input => {
                self.chars.has_capability(Capability::Reprocess)
                    && matches!(stream.format, PixelFormat::Yuv420 | PixelFormat::Raw16)
            }
            StreamType::Output => match stream.format {
                PixelFormat::Raw16 => self.chars.has_capability(Capability::Raw),
                PixelFormat::Depth16 => self.chars.has_capability(Capability::Depth),
                _ => true,
            },
        }
    }
}

#[async_trait]
impl DeviceSessionHwl for SimulatedCameraHwl {
    fn camera_id(&self) -> CameraId {
        self.chars.camera_id
    }

    fn is_stream_combination_supported(&self, config: &StreamConfiguration) -> bool {
        let outputs = config
            .streams
            .iter()
            .filter(|s| s.stream_type == StreamType::Output)
            .count();
        let inputs = config.streams.len() - outputs;
        outputs >= 1 && inputs <= 1 && config.streams.iter().all(|s| self.stream_supported(s))
    }

    async fn configure_pipeline(
        &mut self,
        config: &StreamConfiguration,
        callback: Arc<dyn PipelineCallback>,
    ) -> HalResult<(PipelineId, Vec<HalStream>)> {
        if !self.is_stream_combination_supported(config) {
            return Err(HalError::BadValue(
                "unsupported stream combination".to_string(),
            ));
        }
        if self.sensor.is_some() {
            return Err(HalError::AlreadyExists(
                "pipeline already built; destroy it first".to_string(),
            ));
        }

        let pipeline_id = self.next_pipeline_id;
        self.next_pipeline_id += 1;

        let hal_streams: Vec<HalStream> = config
            .streams
            .iter()
            .map(|s| HalStream {
                id: s.id,
                override_format: s.format,
                producer_usage: s.usage,
                consumer_usage: s.usage,
                max_buffers: self.chars.pipeline.max_buffers_per_stream,
                is_physical: s.physical_camera_id.is_some(),
                physical_camera_id: s.physical_camera_id,
            })
            .collect();
        let streams = config.streams.iter().map(|s| (s.id, s.clone())).collect();
        self.pipeline = Some(ConfiguredPipeline {
            pipeline_id,
            streams,
            callback,
        });
        debug!(pipeline_id, streams = config.streams.len(), "pipeline configured");
        Ok((pipeline_id, hal_streams))
    }

    async fn build_pipelines(&mut self) -> HalResult<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| HalError::NoInit("no pipeline configured".to_string()))?;
        self.sensor = Some(SensorSimulator::start(
            self.chars.clone(),
            pipeline.streams.clone(),
            self.importer.clone(),
            pipeline.callback.clone(),
            self.seed,
        ));
        info!(camera_id = self.chars.camera_id, "pipeline built");
        Ok(())
    }

    async fn submit_requests(
        &mut self,
        pipeline_id: PipelineId,
        requests: Vec<CaptureRequest>,
    ) -> HalResult<()> {
        let configured = self
            .pipeline
            .as_ref()
            .ok_or_else(|| HalError::NoInit("no pipeline configured".to_string()))?;
        if configured.pipeline_id != pipeline_id {
            return Err(HalError::BadValue(format!(
                "unknown pipeline {pipeline_id}"
            )));
        }
        let sensor = self
            .sensor
            .as_ref()
            .ok_or_else(|| HalError::NoInit("pipeline not built".to_string()))?;

        for request in requests {
            let settings = match &request.settings {
                Some(settings) => {
                    self.last_settings = Some(settings.clone());
                    settings.clone()
                }
                None => self.last_settings.clone().ok_or_else(|| {
                    HalError::BadValue(format!(
                        "request {} has no settings and none were retained",
                        request.frame_number
                    ))
                })?,
            };
            let group = self
                .request_state
                .initialize_sensor_settings(&settings, &request.physical_camera_settings)?;
            let result = self
                .request_state
                .initialize_result(pipeline_id, request.frame_number);
            let reprocess_timestamp_ns = settings.get_i64(Tag::SensorTimestamp);

            sensor
                .queue_request(SensorRequest {
                    frame_number: request.frame_number,
                    pipeline_id,
                    settings: group,
                    result,
                    input_buffers: request.input_buffers,
                    output_buffers: request.output_buffers,
                    reprocess_timestamp_ns,
                })
                .await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> HalResult<()> {
        if let Some(sensor) = self.sensor.as_ref() {
            sensor.flush().await?;
        }
        Ok(())
    }

    async fn destroy_pipelines(&mut self) {
        if let Some(mut sensor) = self.sensor.take() {
            sensor.stop().await;
        }
        self.pipeline = None;
        self.last_settings = None;
        debug!(camera_id = self.chars.camera_id, "pipelines destroyed");
    }

    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> HalResult<MetadataStore> {
        default_request_settings(&self.chars, template)
    }
}
