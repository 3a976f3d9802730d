//! Stream lifecycle: capture worker, ring buffer and device-command channel
//!
//! The controller is driven from one consumer/control context. The capture
//! worker runs on its own thread and is the only writer of the ring buffer;
//! the ring and its counters live from [`start`](StreamController::start)
//! until [`stop`](StreamController::stop) has joined the worker.
//!
//! A worker can also end on its own when the device disconnects or keeps
//! failing. The controller then reports `Idle`, frame reads fail with
//! [`StreamError::NotRunning`], and the next `&mut` call joins the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Receiver;
use image::RgbImage;
use tracing::{error, info, instrument, warn};

use super::events::{EventHub, StreamEvent};
use super::metrics::{FpsEstimator, StreamMetrics};
use super::worker::CaptureWorker;
use super::StreamState;
use crate::capture::FrameSource;
use crate::command::{CommandDispatcher, ResolvedPacket};
use crate::config::PipelineConfig;
use crate::display::{to_display_format_adjusted, DisplayAdjust};
use crate::error::StreamError;
use crate::pipeline::{FrameCounters, FrameRingBuffer};

/// The newest frame, converted for display
#[derive(Debug, Clone)]
pub struct LatestFrame {
    pub image: RgbImage,
    pub timestamp: Instant,
    pub sequence: u64,
}

pub struct StreamController {
    name: String,
    config: PipelineConfig,
    state: StreamState,
    counters: Arc<FrameCounters>,
    ring: Option<Arc<FrameRingBuffer>>,
    stop: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    commands: Option<CommandDispatcher>,
    events: Arc<EventHub>,
    display: DisplayAdjust,
    last_displayed: u64,
    fps: FpsEstimator,
}

impl StreamController {
    pub fn new(name: impl Into<String>, config: PipelineConfig, events: Arc<EventHub>) -> Self {
        Self {
            name: name.into(),
            config,
            state: StreamState::Idle,
            counters: Arc::new(FrameCounters::new(false)),
            ring: None,
            stop: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            worker: None,
            commands: None,
            events,
            display: DisplayAdjust::default(),
            last_displayed: 0,
            fps: FpsEstimator::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        match self.state {
            StreamState::Streaming if self.worker_exited() => StreamState::Idle,
            state => state,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Route [`send_command`](Self::send_command) and reinit requests through
    /// `dispatcher`. Takes effect for the capture worker on the next start.
    pub fn attach_dispatcher(&mut self, dispatcher: CommandDispatcher) {
        self.commands = Some(dispatcher);
    }

    /// Take the dispatcher back, e.g. after a failed start.
    pub fn detach_dispatcher(&mut self) -> Option<CommandDispatcher> {
        self.commands.take()
    }

    pub fn has_dispatcher(&self) -> bool {
        self.commands.is_some()
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            self.state = state;
            self.events.publish(StreamEvent::StateChanged(state));
        }
    }

    /// Open `source`, allocate the ring and start capturing.
    ///
    /// A source that fails to open leaves the controller `Idle`; the failure
    /// is also published as a message.
    #[instrument(skip(self, source), fields(device = %self.name))]
    pub fn start(&mut self, mut source: Box<dyn FrameSource>) -> Result<(), StreamError> {
        self.reap_exited_worker();
        if self.state != StreamState::Idle {
            return Err(StreamError::AlreadyRunning);
        }
        self.set_state(StreamState::Connecting);

        let format = match source.open() {
            Ok(format) => format,
            Err(e) => {
                warn!("{}: open failed: {e}", self.name);
                self.events.message(format!(
                    "Error: {} cannot connect to camera. Check deviceID.",
                    self.name
                ));
                self.set_state(StreamState::Idle);
                return Err(StreamError::DeviceConnect {
                    device: self.name.clone(),
                    source: e,
                });
            }
        };

        let counters = Arc::new(FrameCounters::new(source.has_device_counter()));
        let ring = Arc::new(FrameRingBuffer::new(
            self.config.ring_buffer_size,
            format,
            counters.clone(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));

        let worker = CaptureWorker {
            name: self.name.clone(),
            source,
            ring: ring.clone(),
            stop: stop.clone(),
            exited: exited.clone(),
            events: self.events.clone(),
            commands: self.commands.as_ref().map(CommandDispatcher::handle),
            stall_timeout: self.config.stall_timeout(),
            capture_core: self.config.capture_core,
        };
        let handle = thread::Builder::new()
            .name(format!("{}-capture", self.name))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.set_state(StreamState::Idle);
                StreamError::Spawn(e)
            })?;

        info!(
            "{}: streaming {}x{} {:?} into {} slots",
            self.name,
            format.width,
            format.height,
            format.pixel_format,
            ring.capacity()
        );
        self.counters = counters;
        self.ring = Some(ring);
        self.stop = stop;
        self.exited = exited;
        self.worker = Some(handle);
        self.last_displayed = 0;
        self.fps.reset();
        self.set_state(StreamState::Streaming);
        self.events
            .message(format!("{} is connected.", self.name));
        Ok(())
    }

    /// Ask the worker to finish its current slot, join it, then drop the
    /// ring. Frame reads fail with [`StreamError::NotRunning`] afterwards.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn stop(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Streaming {
            return Err(StreamError::NotRunning);
        }
        self.set_state(StreamState::Stopping);

        self.stop.store(true, Ordering::Release);
        if let Some(ring) = &self.ring {
            ring.wake_writer();
        }
        let joined = match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| StreamError::WorkerPanicked),
            None => Ok(()),
        };

        self.ring = None;
        self.set_state(StreamState::Idle);
        info!(
            "{}: stopped, {} frames acquired",
            self.name,
            self.counters.acquired()
        );
        self.events.message(format!("{} disconnected.", self.name));
        joined
    }

    fn worker_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Join a worker that ended without being asked to and fall back to
    /// `Idle`. The worker has already reported why.
    fn reap_exited_worker(&mut self) {
        if self.state != StreamState::Streaming || !self.worker_exited() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{}: capture worker panicked", self.name);
            }
        }
        self.ring = None;
        self.set_state(StreamState::Idle);
        warn!(
            "{}: capture ended on its own after {} frames",
            self.name,
            self.counters.acquired()
        );
    }

    fn ring(&self) -> Result<&Arc<FrameRingBuffer>, StreamError> {
        match (&self.ring, self.state()) {
            (Some(ring), StreamState::Streaming) => Ok(ring),
            _ => Err(StreamError::NotRunning),
        }
    }

    /// Shared handle on the live ring, for FIFO consumers using
    /// [`FrameRingBuffer::acquire_read_slot`]. Such consumers should run
    /// with `release_on_consume` off.
    pub fn ring_buffer(&self) -> Result<Arc<FrameRingBuffer>, StreamError> {
        self.ring().cloned()
    }

    /// Latest-wins read: the most recently committed frame, skipping
    /// anything in between. With `release_on_consume`, every slot up to it
    /// goes back to the writer.
    pub fn latest_frame(&mut self) -> Result<Option<LatestFrame>, StreamError> {
        self.reap_exited_worker();
        let ring = match (&self.ring, self.state) {
            (Some(ring), StreamState::Streaming) => ring,
            _ => return Err(StreamError::NotRunning),
        };

        let display = &self.display;
        let latest = ring.with_latest(|frame| LatestFrame {
            image: to_display_format_adjusted(frame, display),
            timestamp: frame.timestamp,
            sequence: frame.meta.sequence,
        });

        if let Some(latest) = &latest {
            self.last_displayed = latest.sequence;
            self.fps.record(latest.timestamp, latest.sequence);
            if self.config.release_on_consume {
                ring.release_through(latest.sequence);
            }
        }
        Ok(latest)
    }

    /// Like [`latest_frame`](Self::latest_frame) but only when something was
    /// committed since the last read.
    pub fn poll_new_frame(&mut self) -> Result<Option<LatestFrame>, StreamError> {
        self.reap_exited_worker();
        if self.ring()?.counters().acquired() <= self.last_displayed {
            return Ok(None);
        }
        self.latest_frame()
    }

    pub fn buffer_occupancy(&self) -> Result<usize, StreamError> {
        Ok(self.ring()?.occupancy())
    }

    /// `None` when the device has no frame counter of its own.
    pub fn dropped_frame_count(&self) -> Option<i64> {
        self.counters.dropped_frames()
    }

    pub fn frames_acquired(&self) -> u64 {
        self.counters.acquired()
    }

    pub fn inter_frame_interval(&self) -> Result<Option<Duration>, StreamError> {
        Ok(self.ring()?.inter_frame_interval())
    }

    pub fn metrics(&self) -> Result<StreamMetrics, StreamError> {
        let ring = self.ring()?;
        Ok(StreamMetrics {
            acquired: self.counters.acquired(),
            dropped: self.counters.dropped_frames(),
            occupancy: ring.occupancy(),
            inter_frame_interval: ring.inter_frame_interval(),
            fps: self.fps.fps(),
        })
    }

    pub fn display_adjust(&self) -> DisplayAdjust {
        self.display
    }

    pub fn set_display_adjust(&mut self, adjust: DisplayAdjust) {
        self.display = adjust;
    }

    /// Fire-and-forget: bus failures come back as messages, not errors.
    pub fn send_command(&self, packet: ResolvedPacket) {
        match &self.commands {
            Some(commands) => commands.send(packet),
            None => {
                warn!(
                    "{}: no device bus, packet for key {:#x} dropped",
                    self.name, packet.address_key
                );
                metrics::counter!("device_packets_skipped").increment(1);
            }
        }
    }

    /// Replay every init command through the dispatcher.
    pub fn request_reinit(&self) {
        match &self.commands {
            Some(commands) => commands.request_reinit(),
            None => warn!("{}: no device bus, reinit ignored", self.name),
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if self.state == StreamState::Streaming {
            if let Err(e) = self.stop() {
                warn!("{}: {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::{
        Frame, FrameFormat, Grab, PixelFormat, TestPatternConfig, TestPatternSource,
    };
    use crate::error::CaptureError;

    fn pattern(frame_limit: u64) -> Box<dyn FrameSource> {
        Box::new(TestPatternSource::new(TestPatternConfig {
            format: FrameFormat::new(8, 4, PixelFormat::Gray8),
            fps: None,
            frame_limit: Some(frame_limit),
            ..Default::default()
        }))
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn walks_the_state_machine() {
        let events = Arc::new(EventHub::new(32));
        let rx = events.subscribe();
        let mut controller = StreamController::new("cam", PipelineConfig::default(), events);

        controller.start(pattern(1)).unwrap();
        assert_eq!(controller.state(), StreamState::Streaming);
        controller.stop().unwrap();
        assert_eq!(controller.state(), StreamState::Idle);

        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                StreamEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                StreamState::Connecting,
                StreamState::Streaming,
                StreamState::Stopping,
                StreamState::Idle
            ]
        );
    }

    #[test]
    fn refuses_double_start() {
        let mut controller =
            StreamController::new("cam", PipelineConfig::default(), Arc::default());
        controller.start(pattern(1)).unwrap();
        assert!(matches!(
            controller.start(pattern(1)),
            Err(StreamError::AlreadyRunning)
        ));
        controller.stop().unwrap();
    }

    #[test]
    fn poll_reports_only_new_frames() {
        let mut controller =
            StreamController::new("cam", PipelineConfig::default(), Arc::default());
        controller.start(pattern(2)).unwrap();
        wait_for(|| controller.frames_acquired() == 2);

        assert_eq!(controller.poll_new_frame().unwrap().unwrap().sequence, 2);
        assert!(controller.poll_new_frame().unwrap().is_none());
        controller.stop().unwrap();
    }

    #[test]
    fn stop_unblocks_a_writer_waiting_for_slots() {
        let config = PipelineConfig {
            ring_buffer_size: 2,
            release_on_consume: false,
            ..Default::default()
        };
        let mut controller = StreamController::new("cam", config, Arc::default());
        controller.start(pattern(100)).unwrap();
        wait_for(|| controller.frames_acquired() == 2);

        controller.stop().unwrap();
        assert_eq!(controller.frames_acquired(), 2);
    }

    #[test]
    fn commands_without_a_bus_are_dropped_quietly() {
        let controller = StreamController::new("cam", PipelineConfig::default(), Arc::default());
        controller.send_command(ResolvedPacket {
            address_key: 0x20,
            bytes: vec![0x20, 0x01],
        });
        controller.request_reinit();
    }

    struct Garbled;

    impl FrameSource for Garbled {
        fn name(&self) -> &str {
            "garbled"
        }

        fn open(&mut self) -> Result<FrameFormat, CaptureError> {
            Ok(FrameFormat::new(8, 4, PixelFormat::Gray8))
        }

        fn grab(&mut self, _frame: &mut Frame) -> Result<Grab, CaptureError> {
            Err(CaptureError::Decode("bad huffman table".into()))
        }
    }

    #[test]
    fn worker_giving_up_leaves_the_controller_idle() {
        let mut controller =
            StreamController::new("cam", PipelineConfig::default(), Arc::default());
        controller.start(Box::new(Garbled)).unwrap();

        wait_for(|| controller.state() == StreamState::Idle);
        assert!(controller.worker.is_some());
        assert!(matches!(controller.ring_buffer(), Err(StreamError::NotRunning)));

        // The first mutable call joins the worker
        assert!(matches!(controller.latest_frame(), Err(StreamError::NotRunning)));
        assert!(controller.worker.is_none());
        assert!(controller.ring.is_none());
        assert_eq!(controller.state, StreamState::Idle);
    }
}
