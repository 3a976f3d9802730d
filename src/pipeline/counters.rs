//! Acquisition / controller frame counters shared across threads
//!
//! Plain atomics with no further synchronization: a reader may see a value
//! that is one frame stale, which the display and drop statistics tolerate.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Reported in place of a dropped-frame count when the device has no
/// onboard counter.
pub const UNKNOWN_DROPPED_FRAMES: i64 = -1;

#[derive(Debug)]
pub struct FrameCounters {
    /// Frames committed to the ring buffer
    acquired: CachePadded<AtomicU64>,
    /// Frames the device reports having sent, if it keeps count
    controller: Option<CachePadded<AtomicU64>>,
}

impl FrameCounters {
    pub fn new(with_controller: bool) -> Self {
        Self {
            acquired: CachePadded::new(AtomicU64::new(0)),
            controller: with_controller.then(|| CachePadded::new(AtomicU64::new(0))),
        }
    }

    /// Count one committed frame, returning its 1-based sequence number.
    ///
    /// Release pairs with [`acquired`](Self::acquired) so a reader that sees
    /// sequence `n` also sees slot `n` committed.
    pub fn record_acquired(&self) -> u64 {
        self.acquired.fetch_add(1, Ordering::Release) + 1
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    pub fn record_controller(&self) {
        if let Some(controller) = &self.controller {
            controller.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Track an absolute device frame number. Never moves backwards.
    pub fn observe_controller(&self, device_frame: u64) {
        if let Some(controller) = &self.controller {
            controller.fetch_max(device_frame, Ordering::Relaxed);
        }
    }

    pub fn controller(&self) -> Option<u64> {
        self.controller
            .as_ref()
            .map(|controller| controller.load(Ordering::Relaxed))
    }

    /// `controller - acquired`, or `None` without a device counter.
    ///
    /// The writer observes the device count before it bumps `acquired`, so
    /// loading `acquired` first keeps the difference from going negative.
    pub fn dropped_frames(&self) -> Option<i64> {
        let acquired = self.acquired();
        self.controller()
            .map(|controller| controller as i64 - acquired as i64)
    }

    pub fn dropped_frames_or_sentinel(&self) -> i64 {
        self.dropped_frames().unwrap_or(UNKNOWN_DROPPED_FRAMES)
    }
}
