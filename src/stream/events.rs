//! Outbound notifications for UI, loggers and data savers
//!
//! Subscribers get a bounded flume receiver. Events are published from the
//! thread that produced them:
//!
//! - [`StreamEvent::FrameReady`]: capture worker thread
//! - [`StreamEvent::Message`]: capture worker, command dispatcher, or the
//!   caller's thread for lifecycle and control messages
//! - [`StreamEvent::RoiChanged`], [`StreamEvent::PropertyChanged`],
//!   [`StreamEvent::StateChanged`]: the caller's thread
//!
//! A subscriber that falls behind loses events rather than stalling the
//! publisher.

use std::sync::{Mutex, PoisonError};

use flume::{Receiver, Sender, TrySendError};
use tracing::trace;

use super::StreamState;
use crate::config::ControlValue;
use crate::roi::Roi;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    FrameReady { sequence: u64 },
    Message(String),
    RoiChanged(Roi),
    PropertyChanged {
        device: String,
        control: String,
        value: ControlValue,
    },
    StateChanged(StreamState),
}

pub struct EventHub {
    subscribers: Mutex<Vec<Sender<StreamEvent>>>,
    depth: usize,
}

impl EventHub {
    pub fn new(depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            depth: depth.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = flume::bounded(self.depth);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: StreamEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                trace!("subscriber queue full, dropping {:?}", dropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.publish(StreamEvent::Message(text.into()));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_to_every_subscriber() {
        let hub = EventHub::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.message("hello");

        assert_eq!(a.try_recv().unwrap(), StreamEvent::Message("hello".into()));
        assert_eq!(b.try_recv().unwrap(), StreamEvent::Message("hello".into()));
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let hub = EventHub::new(1);
        let rx = hub.subscribe();

        hub.publish(StreamEvent::FrameReady { sequence: 1 });
        hub.publish(StreamEvent::FrameReady { sequence: 2 });

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::FrameReady { sequence: 1 });
    }

    #[test]
    fn forgets_dropped_subscribers() {
        let hub = EventHub::new(4);
        let rx = hub.subscribe();
        drop(rx);

        hub.message("anyone?");
        assert_eq!(hub.subscriber_count(), 0);
    }
}
