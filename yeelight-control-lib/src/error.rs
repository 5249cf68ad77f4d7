//! Error types for the library.
//!
//! Every fallible operation returns [`ControlError`]. The variants follow the
//! failure classes a caller has to tell apart:
//!
//! - **`Format`**: bad user input caught before anything is sent, such as a
//!   malformed hex color.
//! - **`Timeout`**: no matching response (or connect) before the deadline.
//! - **`Connection`** / **`NotConnected`**: socket-level failures, including the
//!   peer closing the connection mid-read.
//! - **`Protocol`**: a frame that is valid JSON but not a known message shape.
//!   The transport skips these internally; the variant exists so that callers
//!   inspecting raw frames can report them.
//! - **`Device`**: the device answered the request with an error object.
//! - **`NoDevicesFound`** / **`AmbiguousSelection`**: target resolution results
//!   that need the caller's attention.

use thiserror::Error;

use crate::util::discovery::Device;

/// Convenience alias for results using the library error type.
pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device returned error {code}: {message}")]
    Device { code: i64, message: String },

    #[error("No devices found")]
    NoDevicesFound,

    #[error("Ambiguous selection: {} devices found, caller must choose", .0.len())]
    AmbiguousSelection(Vec<Device>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// True for errors that mean the deadline passed rather than the peer failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Timeout(_))
    }
}
