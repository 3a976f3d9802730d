//! Behavior-camera acquisition: a semaphore-gated frame pipeline plus the
//! config-driven command protocol that talks to the camera.

pub mod capture;
pub mod command;
pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod roi;
pub mod session;
pub mod stream;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

pub use config::{AppConfig, CameraConfig, DeviceRegistry, DeviceTypeConfig, PipelineConfig};
pub use error::{BusError, CaptureError, CommandError, ConfigError, StreamError};
pub use roi::Roi;
pub use session::CameraSession;
pub use stream::{StreamController, StreamEvent, StreamMetrics, StreamState};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: Lazy<ArcSwap<AppConfig>> =
    Lazy::new(|| ArcSwap::from_pointee(AppConfig::default()));
