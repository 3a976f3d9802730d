//! Semaphore-gated ring buffer for the frame pipeline
//!
//! Slots are allocated once and overwritten in place. `free_slots` caps the
//! capture thread so it never gets more than `N` frames ahead of the
//! consumer; `filled_slots` mirrors how many committed frames are still held.
//! Slot `i` holds the frame with sequence `s` where `i = (s - 1) mod N`.
//!
//! Two read styles are supported:
//!
//! - latest-wins ([`with_latest`](FrameRingBuffer::with_latest)): read the
//!   most recently committed slot, skipping anything in between, and hand
//!   slots back with [`release_through`](FrameRingBuffer::release_through)
//! - strict FIFO ([`acquire_read_slot`](FrameRingBuffer::acquire_read_slot) /
//!   [`release_read_slot`](FrameRingBuffer::release_read_slot))
//!
//! There is exactly one writer with at most one slot in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::counters::FrameCounters;
use super::semaphore::SlotSemaphore;
use crate::capture::frame::{Frame, FrameFormat};
use crate::error::{CaptureError, StreamError};

/// Permit to write one slot, handed out by
/// [`acquire_write_slot`](FrameRingBuffer::acquire_write_slot).
#[derive(Debug)]
#[must_use = "a write slot must be committed or cancelled"]
pub struct WriteSlot {
    pub index: usize,
    pub sequence: u64,
}

/// Permit to read one slot in FIFO order.
#[derive(Debug)]
#[must_use = "a read slot must be released"]
pub struct ReadSlot {
    pub index: usize,
    pub sequence: u64,
}

pub struct FrameRingBuffer {
    slots: Box<[Mutex<Frame>]>,
    free_slots: SlotSemaphore,
    filled_slots: SlotSemaphore,
    counters: Arc<FrameCounters>,
    next_read: AtomicU64,
    released_through: AtomicU64,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize, format: FrameFormat, counters: Arc<FrameCounters>) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Mutex::new(Frame::blank(format)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            free_slots: SlotSemaphore::new(capacity, capacity),
            filled_slots: SlotSemaphore::new(capacity, 0),
            counters,
            next_read: AtomicU64::new(0),
            released_through: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn counters(&self) -> &Arc<FrameCounters> {
        &self.counters
    }

    fn index_of(&self, sequence: u64) -> usize {
        ((sequence - 1) % self.slots.len() as u64) as usize
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Frame> {
        // A panicking reader must not take the capture thread down with it.
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_write_slot(&self) -> WriteSlot {
        let sequence = self.counters.acquired() + 1;
        WriteSlot {
            index: self.index_of(sequence),
            sequence,
        }
    }

    /// Block until a slot is free.
    pub fn acquire_write_slot(&self) -> WriteSlot {
        self.free_slots.acquire();
        self.next_write_slot()
    }

    /// Like [`acquire_write_slot`](Self::acquire_write_slot) but reports a
    /// stalled pipeline after `timeout`.
    pub fn acquire_write_slot_timeout(&self, timeout: Duration) -> Result<WriteSlot, StreamError> {
        if self.free_slots.acquire_timeout(timeout) {
            Ok(self.next_write_slot())
        } else {
            Err(StreamError::PipelineStalled(timeout))
        }
    }

    /// Lock the slot for in-place filling.
    pub fn write_slot(&self, slot: &WriteSlot) -> MutexGuard<'_, Frame> {
        self.lock(slot.index)
    }

    /// Publish the filled slot, count it as acquired and mark it occupied.
    pub fn commit_write(
        &self,
        slot: WriteSlot,
        mut frame: MutexGuard<'_, Frame>,
        timestamp: Instant,
    ) -> u64 {
        frame.meta.sequence = slot.sequence;
        frame.timestamp = timestamp;
        drop(frame);

        let sequence = self.counters.record_acquired();
        self.filled_slots.release();
        metrics::gauge!("ring_buffer_occupancy").set(self.filled_slots.available() as f64);
        sequence
    }

    /// Copy `data` into the slot and commit it.
    pub fn commit_frame(
        &self,
        slot: WriteSlot,
        data: &[u8],
        timestamp: Instant,
    ) -> Result<u64, CaptureError> {
        let mut frame = self.write_slot(&slot);
        if let Err(e) = frame.fill_from(data) {
            drop(frame);
            self.cancel_write(slot);
            return Err(e);
        }
        Ok(self.commit_write(slot, frame, timestamp))
    }

    /// Give back a slot that was never touched.
    pub fn cancel_write(&self, _slot: WriteSlot) {
        self.free_slots.release();
    }

    /// Give back a slot whose contents may be half-written. Readers will
    /// see it as empty until it is committed again.
    pub fn abandon_write(&self, _slot: WriteSlot, mut frame: MutexGuard<'_, Frame>) {
        frame.meta.sequence = 0;
        drop(frame);
        self.free_slots.release();
    }

    /// Unblock a writer parked in [`acquire_write_slot`](Self::acquire_write_slot).
    /// Used on shutdown only; it may leave one permit more than slots.
    pub fn wake_writer(&self) {
        self.free_slots.release();
    }

    /// Run `f` on the most recently committed frame, if any.
    pub fn with_latest<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let sequence = self.counters.acquired();
        if sequence == 0 {
            return None;
        }
        let frame = self.lock(self.index_of(sequence));
        if frame.meta.sequence == 0 {
            return None;
        }
        Some(f(&frame))
    }

    /// Timestamp delta between the two newest frames, when both are still
    /// held by the buffer.
    pub fn inter_frame_interval(&self) -> Option<Duration> {
        let sequence = self.counters.acquired();
        if sequence < 2 || self.slots.len() < 2 {
            return None;
        }
        let newest = self.timestamp_of(sequence)?;
        let previous = self.timestamp_of(sequence - 1)?;
        newest.checked_duration_since(previous)
    }

    fn timestamp_of(&self, sequence: u64) -> Option<Instant> {
        let frame = self.lock(self.index_of(sequence));
        (frame.meta.sequence == sequence).then_some(frame.timestamp)
    }

    /// Latest-wins consumer: everything up to and including `sequence` has
    /// been shown, hand those slots back to the writer.
    pub fn release_through(&self, sequence: u64) -> usize {
        let mut through = self.released_through.load(Ordering::Acquire);
        let mut released = 0;
        while through < sequence && self.filled_slots.try_acquire() {
            self.free_slots.release();
            through += 1;
            released += 1;
        }
        self.released_through.store(through, Ordering::Release);
        released
    }

    /// Strict consumer: wait for the oldest unread frame.
    pub fn acquire_read_slot(&self) -> ReadSlot {
        self.filled_slots.acquire();
        self.next_read_slot()
    }

    pub fn acquire_read_slot_timeout(&self, timeout: Duration) -> Option<ReadSlot> {
        self.filled_slots
            .acquire_timeout(timeout)
            .then(|| self.next_read_slot())
    }

    fn next_read_slot(&self) -> ReadSlot {
        let sequence = self.next_read.fetch_add(1, Ordering::AcqRel) + 1;
        ReadSlot {
            index: self.index_of(sequence),
            sequence,
        }
    }

    pub fn read_slot(&self, slot: &ReadSlot) -> MutexGuard<'_, Frame> {
        self.lock(slot.index)
    }

    /// Strict consumer: the slot's data has been fully used.
    pub fn release_read_slot(&self, slot: ReadSlot) {
        self.released_through
            .fetch_max(slot.sequence, Ordering::AcqRel);
        self.free_slots.release();
    }

    /// Committed frames not yet handed back (advisory).
    pub fn occupancy(&self) -> usize {
        self.filled_slots.available()
    }

    pub fn free(&self) -> usize {
        self.free_slots.available()
    }
}

impl fmt::Debug for FrameRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRingBuffer")
            .field("capacity", &self.capacity())
            .field("occupancy", &self.occupancy())
            .field("free", &self.free())
            .field("acquired", &self.counters.acquired())
            .finish()
    }
}
