//! V4L2 capture source with memory-mapped buffers

use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder::{decode_into, WireFormat};
use super::frame::{Frame, FrameFormat, PixelFormat};
use super::source::{FrameSource, Grab};
use crate::error::CaptureError;

#[derive(Debug, Clone)]
pub struct V4l2Config {
    pub name: String,
    pub device_id: usize,
    pub width: u32,
    pub height: u32,
    pub is_color: bool,
    pub buffer_count: u32,
    /// Treat the driver's buffer sequence as the device-side frame counter
    pub device_counter: bool,
}

pub struct V4l2Source {
    config: V4l2Config,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    wire: WireFormat,
    first_sequence: Option<u32>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            device: None,
            stream: None,
            wire: WireFormat::Yuyv,
            first_sequence: None,
        }
    }

    fn path(&self) -> String {
        format!("/dev/video{}", self.config.device_id)
    }

    fn open_err(&self, reason: impl ToString) -> CaptureError {
        CaptureError::Open {
            device: self.path(),
            reason: reason.to_string(),
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self), fields(device = %self.path()))]
    fn open(&mut self) -> Result<FrameFormat, CaptureError> {
        let device = Device::new(self.config.device_id).map_err(|e| self.open_err(e))?;

        let caps = device.query_caps().map_err(|e| self.open_err(e))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(self.open_err("device doesn't support video capture"));
        }

        let (fourcc, wire, pixel_format) = if self.config.is_color {
            (FourCC::new(b"MJPG"), WireFormat::Mjpeg, PixelFormat::Bgr24)
        } else {
            (FourCC::new(b"YUYV"), WireFormat::Yuyv, PixelFormat::Gray8)
        };

        let mut fmt = device.format().map_err(|e| self.open_err(e))?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = fourcc;
        let actual = device.set_format(&fmt).map_err(|e| self.open_err(e))?;
        if actual.fourcc != fourcc {
            return Err(self.open_err(format!("driver refused {fourcc}, offers {}", actual.fourcc)));
        }
        if actual.width != self.config.width || actual.height != self.config.height {
            warn!(
                "Requested {}x{}, driver chose {}x{}",
                self.config.width, self.config.height, actual.width, actual.height
            );
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)
            .map_err(|e| self.open_err(e))?;
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );

        self.device = Some(Box::new(device));
        self.stream = Some(stream);
        self.wire = wire;
        self.first_sequence = None;

        Ok(FrameFormat::new(actual.width, actual.height, pixel_format))
    }

    fn grab(&mut self, frame: &mut Frame) -> Result<Grab, CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::Disconnected)?;

        let (buf, meta) = stream.next()?;
        let timestamp = Instant::now();

        decode_into(buf, self.wire, frame)?;
        frame.meta.device_timestamp = Some(
            Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        );

        let first = *self.first_sequence.get_or_insert(meta.sequence);
        let device_frame = self
            .config
            .device_counter
            .then(|| u64::from(meta.sequence.wrapping_sub(first)) + 1);

        Ok(Grab::Frame {
            timestamp,
            device_frame,
        })
    }

    fn has_device_counter(&self) -> bool {
        self.config.device_counter
    }

    fn close(&mut self) {
        self.stream = None;
        self.device = None;
        info!("Closed {}", self.path());
    }
}
