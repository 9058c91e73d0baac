//! Error types for the HAL.
//!
//! This module defines the primary error type, `HalError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the capture
//! pipeline can hit, from configuration problems to buffer starvation.
//!
//! ## Error classes
//!
//! - **`BadValue`**: the caller handed the HAL something semantically
//!   invalid (unconfigured stream, missing first-request settings, a buffer
//!   handle that contradicts the imported-handle map). Returned synchronously
//!   from the offending call; no partial state is committed.
//! - **`AlreadyExists` / `NoInit` / `NotFound`**: lifecycle misuse. These are
//!   caller bugs rather than runtime conditions and never resolve on retry.
//! - **`TimedOut`**: a bounded wait expired (admission backpressure or a
//!   buffer fetch round trip). The request that hit it is reported through
//!   the processed-count shortfall so the client can resubmit.
//! - **`Flushing`**: the operation raced an in-progress flush and was
//!   resolved with a synthesized error notification instead.
//! - **`Config` / `Io`**: characteristics-file problems at startup. These
//!   are fatal: the device never becomes ready and no retry is attempted.
//!
//! Every component below the session returns `HalResult`; only the session
//! layer translates a failure into a client-visible notification.

use thiserror::Error;

/// Convenience alias for results using the HAL error type.
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum HalError {
    /// Semantically invalid argument. No partial state change is committed.
    #[error("Bad value: {0}")]
    BadValue(String),

    /// An entity with the same identity is already registered.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The component was used before successful initialization.
    #[error("Not initialized: {0}")]
    NoInit(String),

    /// A referenced entity is unknown to the component.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait expired before the condition was met.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// The operation raced an in-progress flush.
    #[error("Session is flushing")]
    Flushing,

    /// Characteristics failed parsing or validation at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure while reading a characteristics file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation or unclassified failure.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for HalError {
    fn from(err: serde_json::Error) -> Self {
        HalError::Config(err.to_string())
    }
}

/// Per-stream failure codes for the HAL buffer management protocol.
///
/// Returned by the client's buffer-request callback and surfaced unchanged
/// through the stream buffer cache manager to the hardware layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRequestError {
    /// The client currently has no free buffer for this stream.
    NoBufferAvailable,
    /// Granting the request would exceed the stream's declared max buffers.
    MaxBufferExceeded,
    /// The stream was torn down while the request was in flight.
    StreamDisconnected,
    /// Unclassified failure, including fetch timeouts.
    Unknown,
}

impl std::fmt::Display for BufferRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BufferRequestError::NoBufferAvailable => "no buffer available",
            BufferRequestError::MaxBufferExceeded => "max buffer count exceeded",
            BufferRequestError::StreamDisconnected => "stream disconnected",
            BufferRequestError::Unknown => "unknown buffer request failure",
        };
        f.write_str(text)
    }
}
