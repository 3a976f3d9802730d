use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::CaptureError;

/// Frame storage that is overwritten in place when its ring slot is reused
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel bytes, `stride * height` long
    pub data: BytesMut,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Acquisition timestamp (monotonic)
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    /// 1-based acquisition sequence; 0 means the slot was never written
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    pub fn for_color(is_color: bool) -> Self {
        if is_color {
            PixelFormat::Bgr24
        } else {
            PixelFormat::Gray8
        }
    }
}

/// Geometry reported by a source once it is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    pub fn stride(&self) -> u32 {
        self.width * self.pixel_format.channels()
    }

    pub fn byte_len(&self) -> usize {
        self.stride() as usize * self.height as usize
    }
}

impl Frame {
    /// Zeroed frame sized for `format`, allocated once per slot
    pub fn blank(format: FrameFormat) -> Self {
        Self {
            data: BytesMut::zeroed(format.byte_len()),
            meta: FrameMetadata {
                sequence: 0,
                width: format.width,
                height: format.height,
                stride: format.stride(),
                format: format.pixel_format,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
        }
    }

    pub fn format(&self) -> FrameFormat {
        FrameFormat::new(self.meta.width, self.meta.height, self.meta.format)
    }

    pub fn channels(&self) -> u32 {
        self.meta.format.channels()
    }

    /// Copy `src` over the existing pixel storage without reallocating
    pub fn fill_from(&mut self, src: &[u8]) -> Result<(), CaptureError> {
        if src.len() != self.data.len() {
            return Err(CaptureError::FrameSize {
                got: src.len(),
                expected: self.data.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_frame_matches_geometry() {
        let frame = Frame::blank(FrameFormat::new(4, 3, PixelFormat::Bgr24));
        assert_eq!(frame.data.len(), 36);
        assert_eq!(frame.meta.stride, 12);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.meta.sequence, 0);
    }

    #[test]
    fn fill_rejects_wrong_size() {
        let mut frame = Frame::blank(FrameFormat::new(2, 2, PixelFormat::Gray8));
        assert!(frame.fill_from(&[1, 2, 3]).is_err());
        frame.fill_from(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&frame.data[..], &[1, 2, 3, 4]);
    }
}
