//! Behavior camera acquisition

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use behavcam::capture::{FrameSource, TestPatternConfig, TestPatternSource};
use behavcam::command::{DeviceBus, LoggingBus};
use behavcam::config::SourceKind;
use behavcam::{AppConfig, CameraSession, DeviceRegistry, StreamEvent};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("behavcam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("behavcam launching...");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("behavcam.toml"));
    let config = AppConfig::load(Some(config_path.as_path()))?;
    behavcam::CONFIG.store(Arc::new(config.clone()));

    DeviceRegistry::load(&config.device_config_path)?.install()?;
    let mut session = CameraSession::from_config(&config)?;
    let events = session.subscribe();

    let source = build_source(&config, &session)?;
    let bus: Option<Box<dyn DeviceBus>> = Some(Box::new(LoggingBus));
    session.connect(source, bus)?;

    // Forward session messages to the log
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                StreamEvent::Message(text) => info!("{text}"),
                StreamEvent::RoiChanged(roi) => info!("ROI {roi}"),
                _ => {}
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut frame_ticker = tokio::time::interval(Duration::from_millis(15));
    let mut metrics_ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = frame_ticker.tick() => {
                // Stand-in for a renderer: consume the newest frame.
                if let Err(e) = session.controller_mut().poll_new_frame() {
                    warn!("frame read failed: {e}");
                    break;
                }
            }
            _ = metrics_ticker.tick() => match session.controller().metrics() {
                Ok(m) => info!(
                    "acquired={} dropped={} buffer={} fps={:.1} interval={:?}",
                    m.acquired,
                    m.dropped.map_or_else(|| "n/a".to_string(), |d| d.to_string()),
                    m.occupancy,
                    m.fps,
                    m.inter_frame_interval,
                ),
                Err(e) => warn!("{e}"),
            },
        }
    }

    session.close()?;
    info!("behavcam shutting down");
    Ok(())
}

fn build_source(config: &AppConfig, session: &CameraSession) -> Result<Box<dyn FrameSource>> {
    let device = session.device();
    match config.source {
        SourceKind::Test => Ok(Box::new(TestPatternSource::new(TestPatternConfig {
            name: session.name().to_string(),
            format: device.frame_format(),
            device_counter: !device.capture_only,
            ..Default::default()
        }))),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(behavcam::capture::V4l2Source::new(
            behavcam::capture::V4l2Config {
                name: session.name().to_string(),
                device_id: config.camera.device_id as usize,
                width: device.width,
                height: device.height,
                is_color: device.is_color,
                buffer_count: 4,
                device_counter: !device.capture_only,
            },
        ))),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(eyre!("built without the v4l2 feature")),
    }
}
