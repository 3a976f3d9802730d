//! Application configuration and the device-description registry
//!
//! Two layers:
//!
//! - [`AppConfig`]: this process's settings (TOML file + `BEHAVCAM__*`
//!   environment), including the per-camera user overrides
//! - [`DeviceRegistry`]: what each device type is (geometry, controls,
//!   init commands), loaded once from a JSON description file and handed to
//!   sessions as `Arc<DeviceTypeConfig>`

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::{FrameFormat, PixelFormat};
use crate::command::RawCommand;
use crate::error::ConfigError;
use crate::roi::Roi;

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device_config_path: PathBuf,
    pub source: SourceKind,
    pub pipeline: PipelineConfig,
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Test,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ring_buffer_size: usize,
    /// Latest-wins reads hand displayed slots back to the capture thread
    pub release_on_consume: bool,
    /// Bounded wait for a free slot; unset blocks indefinitely
    pub stall_timeout_ms: Option<u64>,
    /// Pin the capture thread to this core
    pub capture_core: Option<usize>,
    pub event_queue_depth: usize,
}

/// Per-camera user settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device_type: String,
    pub device_id: u32,
    pub device_name: Option<String>,
    pub compression: String,
    pub window_scale: f64,
    pub show_saturation: bool,
    /// Native-pixel region of interest
    pub roi: Option<Roi>,
    /// Start-value overrides keyed by control name
    pub controls: BTreeMap<String, ControlValue>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_config_path: PathBuf::from("deviceConfigs/behaviorCams.json"),
            source: SourceKind::Test,
            pipeline: PipelineConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 10,
            release_on_consume: true,
            stall_timeout_ms: None,
            capture_core: None,
            event_queue_depth: 64,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_type: "WebCam".into(),
            device_id: 0,
            device_name: None,
            compression: "None".into(),
            window_scale: 1.0,
            show_saturation: false,
            roi: None,
            controls: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid by `path` (if it exists), overlaid by
    /// `BEHAVCAM__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("BEHAVCAM")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

impl PipelineConfig {
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

impl CameraConfig {
    pub fn name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| format!("Behavior Cam {}", self.device_id))
    }

    /// Keys may have been case-folded by the config layer, so match loosely.
    pub fn control_override(&self, control: &str) -> Option<&ControlValue> {
        self.controls.get(control).or_else(|| {
            self.controls
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(control))
                .map(|(_, value)| value)
        })
    }
}

/// A control's value as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Number(f64),
    Text(String),
}

impl ControlValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Number(v) => Some(*v),
            ControlValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Number(v) => write!(f, "{v}"),
            ControlValue::Text(s) => f.write_str(s),
        }
    }
}

/// One user-facing control of a device type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSetting {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub start_value: Option<ControlValue>,
    pub step_size: Option<f64>,
    #[serde(default)]
    pub send_command: Vec<RawCommand>,
    /// Presentation keys (labels, display ranges, ...) passed through to the UI
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Description of a device type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTypeConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub is_color: bool,
    #[serde(default)]
    pub pixel_clock: Option<f64>,
    /// Plain capture device: no onboard frame counter, no command bus
    #[serde(default)]
    pub capture_only: bool,
    #[serde(default)]
    pub control_settings: BTreeMap<String, ControlSetting>,
    #[serde(default)]
    pub initialize: Vec<RawCommand>,
}

impl DeviceTypeConfig {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(self.width, self.height, PixelFormat::for_color(self.is_color))
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<DeviceTypeConfig>>,
}

static REGISTRY: OnceCell<DeviceRegistry> = OnceCell::new();

impl DeviceRegistry {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, DeviceTypeConfig> = serde_json::from_str(text)?;
        Ok(Self {
            devices: parsed
                .into_iter()
                .map(|(name, device)| (name, Arc::new(device)))
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&text)?;
        info!(
            "Loaded {} device types from {}",
            registry.devices.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn get(&self, device_type: &str) -> Result<Arc<DeviceTypeConfig>, ConfigError> {
        self.devices
            .get(device_type)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDeviceType {
                device_type: device_type.to_string(),
                known: self.device_types().collect::<Vec<_>>().join(", "),
            })
    }

    /// Device type names in sorted order.
    pub fn device_types(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Publish this registry process-wide. Only the first call succeeds.
    pub fn install(self) -> Result<&'static DeviceRegistry, ConfigError> {
        REGISTRY.set(self).map_err(|_| ConfigError::AlreadyLoaded)?;
        Self::global()
    }

    pub fn global() -> Result<&'static DeviceRegistry, ConfigError> {
        REGISTRY.get().ok_or(ConfigError::NotLoaded)
    }
}
