pub mod decoder;
pub mod frame;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameFormat, FrameMetadata, PixelFormat};
pub use source::{FrameSource, Grab, TestPatternConfig, TestPatternSource};
#[cfg(feature = "v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};
