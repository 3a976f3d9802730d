//! Error types for the command protocol, the frame pipeline and configuration

use std::path::PathBuf;

use thiserror::Error;

use crate::command::Protocol;

/// Problems with a single command template. Never fatal to the pipeline:
/// the offending entry is logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command entry {index}: {reason}")]
    Configuration { index: usize, reason: String },

    #[error("protocol {0:?} is not supported for packet building")]
    UnsupportedProtocol(Protocol),

    #[error("data field {index} holds an unresolvable token {token:?}")]
    InvalidField { index: usize, token: String },

    #[error("data field {index} is a runtime placeholder and cannot be sent at init time")]
    UnresolvedPlaceholder { index: usize },
}

/// Failures reported by the external device bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("device bus is not connected")]
    NotConnected,

    #[error("device rejected packet for key {key:#x}: {reason}")]
    Rejected { key: u64, reason: String },

    #[error("device bus io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture-source failures, surfaced by [`crate::capture::FrameSource`].
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture device {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("capture device disconnected")]
    Disconnected,

    #[error("frame does not fit slot: got {got} bytes, slot holds {expected}")]
    FrameSize { got: usize, expected: usize },

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{device} cannot connect to camera: {source}")]
    DeviceConnect {
        device: String,
        #[source]
        source: CaptureError,
    },

    #[error("stream is not running")]
    NotRunning,

    #[error("stream is already running")]
    AlreadyRunning,

    #[error("pipeline stalled: no free slot after {0:?}")]
    PipelineStalled(std::time::Duration),

    #[error("capture worker panicked")]
    WorkerPanicked,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed device description: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("application config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("unknown device type {device_type:?}, known types: {known}")]
    UnknownDeviceType { device_type: String, known: String },

    #[error("device registry already loaded")]
    AlreadyLoaded,

    #[error("device registry has not been loaded")]
    NotLoaded,
}
