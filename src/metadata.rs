//! Tagged metadata container for request settings and capture results.
//!
//! A deliberately small typed store: tags are a closed enum rather than
//! numeric keys, values are a small union. The session and the hardware layer
//! exchange these by value; nothing here is shared or locked.

use std::collections::HashMap;

use crate::error::{HalError, HalResult};

/// Metadata tags used by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Auto-exposure mode (on/off).
    ControlAeMode,
    /// Auto-exposure state machine output.
    ControlAeState,
    /// Auto-exposure lock.
    ControlAeLock,
    /// Precapture metering trigger.
    ControlAePrecaptureTrigger,
    /// Exposure compensation steps.
    ControlAeExposureCompensation,
    /// Autofocus mode.
    ControlAfMode,
    /// Autofocus state machine output.
    ControlAfState,
    /// Autofocus trigger.
    ControlAfTrigger,
    /// Auto-white-balance mode.
    ControlAwbMode,
    /// Auto-white-balance state machine output.
    ControlAwbState,
    /// Auto-white-balance lock.
    ControlAwbLock,
    /// Overall 3A control mode.
    ControlMode,
    /// Client's declared use case for the request.
    ControlCaptureIntent,
    /// Digital zoom ratio.
    ControlZoomRatio,
    /// Video stabilization mode.
    ControlVideoStabilizationMode,
    /// Edge enhancement mode.
    EdgeMode,
    /// Sensor exposure time, nanoseconds.
    SensorExposureTime,
    /// Sensor frame duration, nanoseconds.
    SensorFrameDuration,
    /// Sensor analog sensitivity (ISO).
    SensorSensitivity,
    /// Start-of-exposure timestamp, nanoseconds.
    SensorTimestamp,
    /// Lens shading map reporting mode.
    StatisticsLensShadingMapMode,
    /// Rotate-and-crop override.
    ScalerRotateAndCrop,
    /// Request pipeline depth, reported in results.
    RequestPipelineDepth,
    /// Vendor tag: thermal throttling engaged.
    ThermalThrottling,
}

/// A metadata value. Variants map to the wire scalar types the tags use.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 8-bit enum value.
    U8(u8),
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer (durations, timestamps).
    I64(i64),
    /// 32-bit float (zoom ratios).
    F32(f32),
}

/// A set of tagged values attached to a request or result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataStore {
    entries: HashMap<Tag, Value>,
}

impl MetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a tag is present.
    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Removes a tag if present.
    pub fn remove(&mut self, tag: Tag) -> Option<Value> {
        self.entries.remove(&tag)
    }

    /// Sets a raw value, replacing any previous entry.
    pub fn set(&mut self, tag: Tag, value: Value) {
        self.entries.insert(tag, value);
    }

    /// Raw access to a value.
    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.entries.get(&tag)
    }

    /// Sets an 8-bit enum tag.
    pub fn set_u8(&mut self, tag: Tag, value: u8) {
        self.set(tag, Value::U8(value));
    }

    /// Sets a 32-bit integer tag.
    pub fn set_i32(&mut self, tag: Tag, value: i32) {
        self.set(tag, Value::I32(value));
    }

    /// Sets a 64-bit integer tag.
    pub fn set_i64(&mut self, tag: Tag, value: i64) {
        self.set(tag, Value::I64(value));
    }

    /// Sets a float tag.
    pub fn set_f32(&mut self, tag: Tag, value: f32) {
        self.set(tag, Value::F32(value));
    }

    /// Reads an 8-bit enum tag, if present with the right type.
    pub fn get_u8(&self, tag: Tag) -> Option<u8> {
        match self.entries.get(&tag) {
            Some(Value::U8(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads a 32-bit integer tag, if present with the right type.
    pub fn get_i32(&self, tag: Tag) -> Option<i32> {
        match self.entries.get(&tag) {
            Some(Value::I32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads a 64-bit integer tag, if present with the right type.
    pub fn get_i64(&self, tag: Tag) -> Option<i64> {
        match self.entries.get(&tag) {
            Some(Value::I64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads a float tag, if present with the right type.
    pub fn get_f32(&self, tag: Tag) -> Option<f32> {
        match self.entries.get(&tag) {
            Some(Value::F32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads a required 64-bit tag, `BadValue` if missing or mistyped.
    pub fn require_i64(&self, tag: Tag) -> HalResult<i64> {
        self.get_i64(tag)
            .ok_or_else(|| HalError::BadValue(format!("missing i64 tag {tag:?}")))
    }

    /// Reads a required 32-bit tag, `BadValue` if missing or mistyped.
    pub fn require_i32(&self, tag: Tag) -> HalResult<i32> {
        self.get_i32(tag)
            .ok_or_else(|| HalError::BadValue(format!("missing i32 tag {tag:?}")))
    }

    /// Merges `other` into `self`, overwriting overlapping tags.
    pub fn merge(&mut self, other: &MetadataStore) {
        for (tag, value) in &other.entries {
            self.entries.insert(*tag, value.clone());
        }
    }
}

/// Enum values for [`Tag::ControlAeMode`].
pub mod ae_mode {
    /// Manual exposure control.
    pub const OFF: u8 = 0;
    /// Automatic exposure.
    pub const ON: u8 = 1;
}

/// Enum values for [`Tag::ControlAeState`].
pub mod ae_state {
    pub const INACTIVE: u8 = 0;
    pub const SEARCHING: u8 = 1;
    pub const CONVERGED: u8 = 2;
    pub const LOCKED: u8 = 3;
    pub const PRECAPTURE: u8 = 5;
}

/// Enum values for [`Tag::ControlAePrecaptureTrigger`].
pub mod ae_precapture_trigger {
    pub const IDLE: u8 = 0;
    pub const START: u8 = 1;
    pub const CANCEL: u8 = 2;
}

/// Enum values for [`Tag::ControlAfMode`].
pub mod af_mode {
    pub const OFF: u8 = 0;
    pub const AUTO: u8 = 1;
    pub const MACRO: u8 = 2;
    pub const CONTINUOUS_VIDEO: u8 = 3;
    pub const CONTINUOUS_PICTURE: u8 = 4;
}

/// Enum values for [`Tag::ControlAfState`].
pub mod af_state {
    pub const INACTIVE: u8 = 0;
    pub const PASSIVE_SCAN: u8 = 1;
    pub const PASSIVE_FOCUSED: u8 = 2;
    pub const ACTIVE_SCAN: u8 = 3;
    pub const FOCUSED_LOCKED: u8 = 4;
    pub const NOT_FOCUSED_LOCKED: u8 = 5;
    pub const PASSIVE_UNFOCUSED: u8 = 6;
}

/// Enum values for [`Tag::ControlAfTrigger`].
pub mod af_trigger {
    pub const IDLE: u8 = 0;
    pub const START: u8 = 1;
    pub const CANCEL: u8 = 2;
}

/// Enum values for [`Tag::ControlAwbState`].
pub mod awb_state {
    pub const INACTIVE: u8 = 0;
    pub const SEARCHING: u8 = 1;
    pub const CONVERGED: u8 = 2;
    pub const LOCKED: u8 = 3;
}

/// Enum values for [`Tag::ControlCaptureIntent`].
pub mod capture_intent {
    pub const CUSTOM: u8 = 0;
    pub const PREVIEW: u8 = 1;
    pub const STILL_CAPTURE: u8 = 2;
    pub const VIDEO_RECORD: u8 = 3;
    pub const VIDEO_SNAPSHOT: u8 = 4;
    pub const ZERO_SHUTTER_LAG: u8 = 5;
    pub const MANUAL: u8 = 6;
}

/// Generic on/off enum values shared by lock and mode tags.
pub mod switch_mode {
    pub const OFF: u8 = 0;
    pub const ON: u8 = 1;
}
