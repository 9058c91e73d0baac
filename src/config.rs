//! Camera characteristics configuration.
//!
//! Characteristics are read-only after load: parsed from JSON once, validated,
//! then shared behind an `Arc`. Validation failures are fatal at device
//! create time rather than surfacing later as per-request errors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};
use crate::types::CameraId;

/// Device capabilities advertised to clients and used to gate result tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    /// Baseline auto-everything operation.
    BackwardCompatible,
    /// Manual exposure/gain/duration control.
    ManualSensor,
    /// RAW16 output.
    Raw,
    /// YUV/RAW reprocessing input streams.
    Reprocess,
    /// Depth16 output.
    Depth,
    /// Logical device composed of physical sub-devices.
    LogicalMultiCamera,
}

/// Inclusive numeric range used throughout the characteristics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    /// Smallest accepted value.
    pub min: T,
    /// Largest accepted value.
    pub max: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    /// Clamps `value` into the range.
    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// Whether `value` lies within the range.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Sensor geometry and exposure limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorCharacteristics {
    /// Active array width in pixels.
    pub width: u32,
    /// Active array height in pixels.
    pub height: u32,
    /// Supported exposure times, nanoseconds.
    pub exposure_time_range_ns: Range<i64>,
    /// Supported frame durations, nanoseconds.
    pub frame_duration_range_ns: Range<i64>,
    /// Supported sensitivities (ISO).
    pub sensitivity_range: Range<i32>,
    /// Full well capacity in electrons; sets the saturation point.
    pub full_well_capacity: u32,
    /// Baseline read noise in electrons.
    pub read_noise_electrons: f32,
}

/// 3A tuning parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlCharacteristics {
    /// Exposure compensation steps accepted from requests.
    pub exposure_compensation_range: Range<i32>,
    /// Digital zoom ratios accepted from requests.
    pub zoom_ratio_range: Range<f32>,
    /// Frames AE holds converged before it starts to wander.
    pub stable_ae_max_frames: u32,
}

/// Capture pipeline limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineCharacteristics {
    /// Depth of the sensor's bounded request queue.
    pub request_queue_depth: usize,
    /// Per-stream in-flight buffer limit offered as `HalStream::max_buffers`.
    pub max_buffers_per_stream: u32,
    /// Overrun threshold before a cycle skips its vertical blank sleep,
    /// nanoseconds.
    pub return_result_threshold_ns: i64,
}

/// Full characteristics for one camera device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraCharacteristics {
    /// Device id.
    pub camera_id: CameraId,
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// Physical sub-device ids; empty for plain devices.
    #[serde(default)]
    pub physical_camera_ids: Vec<CameraId>,
    /// Sensor limits.
    pub sensor: SensorCharacteristics,
    /// 3A tuning.
    pub control: ControlCharacteristics,
    /// Pipeline limits.
    pub pipeline: PipelineCharacteristics,
}

impl CameraCharacteristics {
    /// Parses and validates characteristics from a JSON string.
    pub fn from_json(json: &str) -> HalResult<Arc<Self>> {
        let parsed: CameraCharacteristics = serde_json::from_str(json)?;
        parsed.validate()?;
        Ok(Arc::new(parsed))
    }

    /// Parses and validates characteristics from a JSON file.
    pub fn from_file(path: &Path) -> HalResult<Arc<Self>> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Whether the device advertises `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Default frame duration, the midpoint clamp of 30fps into range.
    pub fn default_frame_duration(&self) -> Duration {
        let ns = self.sensor.frame_duration_range_ns.clamp(33_333_333);
        Duration::from_nanos(ns as u64)
    }

    fn validate(&self) -> HalResult<()> {
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(HalError::Config(format!(
                "camera {}: sensor dimensions must be nonzero",
                self.camera_id
            )));
        }
        let ranges_ok = self.sensor.exposure_time_range_ns.min > 0
            && self.sensor.exposure_time_range_ns.min <= self.sensor.exposure_time_range_ns.max
            && self.sensor.frame_duration_range_ns.min > 0
            && self.sensor.frame_duration_range_ns.min <= self.sensor.frame_duration_range_ns.max
            && self.sensor.sensitivity_range.min > 0
            && self.sensor.sensitivity_range.min <= self.sensor.sensitivity_range.max;
        if !ranges_ok {
            return Err(HalError::Config(format!(
                "camera {}: invalid sensor ranges",
                self.camera_id
            )));
        }
        if self.control.zoom_ratio_range.min <= 0.0
            || self.control.zoom_ratio_range.min > self.control.zoom_ratio_range.max
        {
            return Err(HalError::Config(format!(
                "camera {}: invalid zoom ratio range",
                self.camera_id
            )));
        }
        if self.sensor.full_well_capacity == 0 {
            return Err(HalError::Config(format!(
                "camera {}: full well capacity must be nonzero",
                self.camera_id
            )));
        }
        if self.pipeline.request_queue_depth == 0 || self.pipeline.max_buffers_per_stream == 0 {
            return Err(HalError::Config(format!(
                "camera {}: pipeline limits must be nonzero",
                self.camera_id
            )));
        }
        if self.has_capability(Capability::LogicalMultiCamera)
            && self.physical_camera_ids.len() < 2
        {
            return Err(HalError::Config(format!(
                "camera {}: logical device needs at least two physical ids",
                self.camera_id
            )));
        }
        Ok(())
    }
}

/// Characteristics for a reasonable simulated back camera.
///
/// Used by the demo binary and tests; production embedders load JSON.
pub fn default_characteristics(camera_id: CameraId) -> Arc<CameraCharacteristics> {
    Arc::new(CameraCharacteristics {
        camera_id,
        capabilities: vec![
            Capability::BackwardCompatible,
            Capability::ManualSensor,
            Capability::Raw,
            Capability::Reprocess,
        ],
        physical_camera_ids: Vec::new(),
        sensor: SensorCharacteristics {
            width: 640,
            height: 480,
            exposure_time_range_ns: Range {
                min: 100_000,
                max: 100_000_000,
            },
            frame_duration_range_ns: Range {
                min: 16_666_666,
                max: 100_000_000,
            },
            sensitivity_range: Range { min: 100, max: 1600 },
            full_well_capacity: 8000,
            read_noise_electrons: 5.0,
        },
        control: ControlCharacteristics {
            exposure_compensation_range: Range { min: -6, max: 6 },
            zoom_ratio_range: Range { min: 1.0, max: 8.0 },
            stable_ae_max_frames: 100,
        },
        pipeline: PipelineCharacteristics {
            request_queue_depth: 4,
            max_buffers_per_stream: 3,
            return_result_threshold_ns: 10_000_000,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_characteristics_validate() {
        let chars = default_characteristics(0);
        assert!(chars.validate().is_ok());
        assert!(chars.has_capability(Capability::ManualSensor));
    }

    #[test]
    fn test_json_roundtrip() {
        let chars = default_characteristics(3);
        let json = serde_json::to_string(&*chars).unwrap();
        let parsed = CameraCharacteristics::from_json(&json).unwrap();
        assert_eq!(parsed.camera_id, 3);
        assert_eq!(parsed.sensor.width, 640);
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let mut chars = (*default_characteristics(0)).clone();
        chars.sensor.exposure_time_range_ns = Range {
            min: 10,
            max: 5,
        };
        let json = serde_json::to_string(&chars).unwrap();
        let err = CameraCharacteristics::from_json(&json).unwrap_err();
        assert!(matches!(err, HalError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = CameraCharacteristics::from_json("{not json").unwrap_err();
        assert!(matches!(err, HalError::Config(_)));
    }

    #[test]
    fn test_range_clamp() {
        let range = Range { min: 100, max: 1600 };
        assert_eq!(range.clamp(50), 100);
        assert_eq!(range.clamp(2000), 1600);
        assert_eq!(range.clamp(800), 800);
    }

    #[test]
    fn test_logical_requires_physical_ids() {
        let mut chars = (*default_characteristics(0)).clone();
        chars.capabilities.push(Capability::LogicalMultiCamera);
        let json = serde_json::to_string(&chars).unwrap();
        assert!(CameraCharacteristics::from_json(&json).is_err());
    }
}
