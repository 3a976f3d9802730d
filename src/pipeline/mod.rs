pub mod counters;
pub mod ringbuf;
pub mod semaphore;

pub use counters::{FrameCounters, UNKNOWN_DROPPED_FRAMES};
pub use ringbuf::{FrameRingBuffer, ReadSlot, WriteSlot};
pub use semaphore::SlotSemaphore;
