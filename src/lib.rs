//! Camera hardware abstraction layer with a simulated-sensor pipeline.
//!
//! This library contains the device session (request validation, buffer
//! admission and lifecycle, result routing) and a hardware layer boundary
//! behind which the in-tree simulated sensor emulates exposure, 3A control
//! and frame rendering. It is used by the `simulate` binary and by
//! integration tests standing in for a camera service client.

pub mod config;
pub mod error;
pub mod hwl;
pub mod metadata;
pub mod session;
pub mod telemetry;
pub mod thermal;
pub mod types;

pub use error::{BufferRequestError, HalError, HalResult};
pub use session::{CameraDeviceCallback, CameraDeviceSession};
