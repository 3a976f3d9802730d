pub mod controller;
pub mod events;
pub mod metrics;
mod worker;

use serde::Serialize;

pub use controller::{LatestFrame, StreamController};
pub use events::{EventHub, StreamEvent};
pub use metrics::{FpsEstimator, StreamMetrics};

/// Lifecycle of a [`StreamController`]:
/// `Idle -> Connecting -> Streaming -> Stopping -> Idle`.
/// A failed connect goes straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
}
