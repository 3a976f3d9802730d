//! Counting semaphore built from a bounded channel of permits
//!
//! Each queued `()` is one permit. Acquiring parks the thread on the
//! channel (no spinning); releasing puts a permit back. The channel bound
//! caps the count at the slot capacity.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

pub struct SlotSemaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
    capacity: usize,
}

impl SlotSemaphore {
    pub fn new(capacity: usize, initial: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        let sem = Self { tx, rx, capacity };
        sem.release_many(initial.min(capacity));
        sem
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        // Both ends live in `self`, so the channel can never disconnect.
        let _ = self.rx.recv();
    }

    /// Take a permit, giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Return a permit. False if the count was already at capacity.
    pub fn release(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    pub fn release_many(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.release()).count()
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
