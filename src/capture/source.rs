//! Capture sources feeding the frame pipeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::frame::{Frame, FrameFormat, PixelFormat};
use crate::error::CaptureError;

/// Outcome of one grab attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grab {
    /// The slot now holds a new frame
    Frame {
        timestamp: Instant,
        /// Frame count reported by the device's own controller, if any
        device_frame: Option<u64>,
    },
    /// Nothing arrived this time; the slot is untouched
    Empty,
}

/// A device that yields raw frames. Runs on the capture worker thread only.
pub trait FrameSource: Send + 'static {
    fn name(&self) -> &str;

    /// Open the device and report the geometry every frame will have.
    fn open(&mut self) -> Result<FrameFormat, CaptureError>;

    /// Fill `frame` in place. `frame` is pre-sized to the format from `open`.
    fn grab(&mut self, frame: &mut Frame) -> Result<Grab, CaptureError>;

    /// Whether [`Grab::Frame::device_frame`] is populated.
    fn has_device_counter(&self) -> bool {
        false
    }

    /// True once after the device asked for its init commands again.
    fn take_reinit_request(&mut self) -> bool {
        false
    }

    fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct TestPatternConfig {
    pub name: String,
    pub format: FrameFormat,
    /// Paced frame rate; `None` produces as fast as slots free up
    pub fps: Option<u32>,
    /// Stop producing after this many frames
    pub frame_limit: Option<u64>,
    /// Report a device-side frame counter
    pub device_counter: bool,
    /// Every n-th frame the device counter skips one, simulating a drop
    pub drop_every: Option<u64>,
    /// Refuse to open, simulating a missing camera
    pub fail_open: bool,
}

impl Default for TestPatternConfig {
    fn default() -> Self {
        Self {
            name: "Test Pattern".into(),
            format: FrameFormat::new(640, 480, PixelFormat::Gray8),
            fps: Some(30),
            frame_limit: None,
            device_counter: false,
            drop_every: None,
            fail_open: false,
        }
    }
}

/// Synthetic source drawing a moving diagonal gradient
pub struct TestPatternSource {
    config: TestPatternConfig,
    produced: u64,
    device_frames: u64,
    next_due: Option<Instant>,
    reinit: Arc<AtomicBool>,
}

impl TestPatternSource {
    pub fn new(config: TestPatternConfig) -> Self {
        Self {
            config,
            produced: 0,
            device_frames: 0,
            next_due: None,
            reinit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes the source ask for its init commands on the next grab,
    /// the way a camera does after it reconnects.
    pub fn reinit_trigger(&self) -> Arc<AtomicBool> {
        self.reinit.clone()
    }

    fn frame_interval(&self) -> Option<Duration> {
        self.config
            .fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_micros(1_000_000 / u64::from(fps)))
    }

    fn draw(&self, frame: &mut Frame) {
        let channels = frame.channels() as usize;
        let width = frame.meta.width as usize;
        let shift = self.produced as usize;
        for (i, px) in frame.data.chunks_exact_mut(channels).enumerate() {
            let (x, y) = (i % width, i / width);
            let v = ((x + y + shift) & 0xFF) as u8;
            for (c, byte) in px.iter_mut().enumerate() {
                *byte = v.wrapping_add((c * 85) as u8);
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&mut self) -> Result<FrameFormat, CaptureError> {
        if self.config.fail_open {
            return Err(CaptureError::Open {
                device: self.config.name.clone(),
                reason: "no such device".into(),
            });
        }
        info!(
            "Test pattern source opened: {}x{} {:?}",
            self.config.format.width, self.config.format.height, self.config.format.pixel_format
        );
        self.produced = 0;
        self.device_frames = 0;
        self.next_due = None;
        Ok(self.config.format)
    }

    fn grab(&mut self, frame: &mut Frame) -> Result<Grab, CaptureError> {
        if self
            .config
            .frame_limit
            .is_some_and(|limit| self.produced >= limit)
        {
            thread::sleep(Duration::from_millis(2));
            return Ok(Grab::Empty);
        }

        if let Some(interval) = self.frame_interval() {
            let due = self.next_due.unwrap_or_else(Instant::now);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
            self.next_due = Some(due + interval);
        }

        self.draw(frame);
        self.produced += 1;
        self.device_frames += 1;
        if self
            .config
            .drop_every
            .is_some_and(|n| n > 0 && self.produced % n == 0)
        {
            self.device_frames += 1;
        }

        if self.produced % 300 == 0 {
            debug!("Test source: {} frames generated", self.produced);
        }

        Ok(Grab::Frame {
            timestamp: Instant::now(),
            device_frame: self.config.device_counter.then_some(self.device_frames),
        })
    }

    fn has_device_counter(&self) -> bool {
        self.config.device_counter
    }

    fn take_reinit_request(&mut self) -> bool {
        self.reinit.swap(false, Ordering::AcqRel)
    }

    fn close(&mut self) {
        info!("Test pattern source stopped after {} frames", self.produced);
    }
}
