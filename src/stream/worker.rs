//! Capture worker: the only writer of a stream's ring buffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::events::{EventHub, StreamEvent};
use crate::capture::{FrameSource, Grab};
use crate::command::DispatchHandle;
use crate::error::CaptureError;
use crate::pipeline::FrameRingBuffer;

/// Give up after this many grab failures in a row.
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

pub(super) struct CaptureWorker {
    pub name: String,
    pub source: Box<dyn FrameSource>,
    pub ring: Arc<FrameRingBuffer>,
    pub stop: Arc<AtomicBool>,
    /// Set once `run` returns for any reason, panics included
    pub exited: Arc<AtomicBool>,
    pub events: Arc<EventHub>,
    pub commands: Option<DispatchHandle>,
    pub stall_timeout: Option<Duration>,
    pub capture_core: Option<usize>,
}

impl CaptureWorker {
    pub fn run(mut self) {
        let _exited = ExitFlag(self.exited.clone());
        if let Some(core) = self.capture_core {
            pin_to_core(core);
        }
        info!("{}: capture started", self.name);

        let mut consecutive_errors = 0u32;
        while !self.stop.load(Ordering::Acquire) {
            let slot = match self.stall_timeout {
                None => self.ring.acquire_write_slot(),
                Some(timeout) => match self.ring.acquire_write_slot_timeout(timeout) {
                    Ok(slot) => slot,
                    Err(e) => {
                        warn!("{}: {e}", self.name);
                        metrics::counter!("pipeline_stalls").increment(1);
                        continue;
                    }
                },
            };

            // Stop is only honoured between slots, never mid-write.
            if self.stop.load(Ordering::Acquire) {
                self.ring.cancel_write(slot);
                break;
            }

            if self.source.take_reinit_request() {
                self.forward_reinit();
            }

            let mut frame = self.ring.write_slot(&slot);
            match self.source.grab(&mut frame) {
                Ok(Grab::Frame {
                    timestamp,
                    device_frame,
                }) => {
                    consecutive_errors = 0;
                    // Device count first, so no reader sees more frames
                    // acquired than the device has sent.
                    if let Some(device_frame) = device_frame {
                        self.ring.counters().observe_controller(device_frame);
                    }
                    let sequence = self.ring.commit_write(slot, frame, timestamp);

                    metrics::counter!("frames_captured").increment(1);
                    if let Some(interval) = self.ring.inter_frame_interval() {
                        metrics::histogram!("inter_frame_interval_ms")
                            .record(interval.as_secs_f64() * 1000.0);
                    }
                    trace!("{}: frame {sequence} committed", self.name);
                    self.events.publish(StreamEvent::FrameReady { sequence });
                }
                Ok(Grab::Empty) => {
                    drop(frame);
                    self.ring.cancel_write(slot);
                }
                Err(CaptureError::Disconnected) => {
                    self.ring.abandon_write(slot, frame);
                    error!("{}: capture device disconnected", self.name);
                    self.events
                        .message(format!("{} lost connection to camera.", self.name));
                    break;
                }
                Err(e) => {
                    self.ring.abandon_write(slot, frame);
                    consecutive_errors += 1;
                    warn!("{}: capture error: {e}", self.name);
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!(
                            "{}: {consecutive_errors} capture errors in a row, giving up",
                            self.name
                        );
                        self.events
                            .message(format!("Error: {} stopped capturing: {e}", self.name));
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        self.source.close();
        info!(
            "{}: capture stopped after {} frames",
            self.name,
            self.ring.counters().acquired()
        );
    }

    fn forward_reinit(&self) {
        match &self.commands {
            Some(commands) => {
                info!("{}: device requested re-initialization", self.name);
                commands.request_reinit();
            }
            None => debug!("{}: reinit requested but no device bus attached", self.name),
        }
    }
}

struct ExitFlag(Arc<AtomicBool>);

impl Drop for ExitFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .is_some_and(core_affinity::set_for_current);
    if pinned {
        debug!("capture thread pinned to core {core}");
    } else {
        warn!("could not pin capture thread to core {core}");
    }
}
