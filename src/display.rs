//! Conversion of slot frames into displayable RGB images

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::capture::{Frame, PixelFormat};

/// Display-only adjustments. They never reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayAdjust {
    /// Gain applied to every channel
    pub alpha: f64,
    /// Offset added after the gain
    pub beta: f64,
    /// Paint saturated pixels red
    pub show_saturation: bool,
}

impl Default for DisplayAdjust {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.0,
            show_saturation: false,
        }
    }
}

impl DisplayAdjust {
    fn is_identity(&self) -> bool {
        self.alpha == 1.0 && self.beta == 0.0
    }

    fn apply(&self, v: u8) -> u8 {
        (f64::from(v) * self.alpha + self.beta).round().clamp(0.0, 255.0) as u8
    }
}

pub fn to_display_format(frame: &Frame) -> RgbImage {
    to_display_format_adjusted(frame, &DisplayAdjust::default())
}

/// Grey frames are replicated to three channels, BGR frames are swapped to
/// RGB, RGB frames are copied.
pub fn to_display_format_adjusted(frame: &Frame, adjust: &DisplayAdjust) -> RgbImage {
    let stride = frame.meta.stride as usize;
    let channels = frame.channels() as usize;
    let data = &frame.data[..];

    RgbImage::from_fn(frame.meta.width, frame.meta.height, |x, y| {
        let at = y as usize * stride + x as usize * channels;
        let px = |c: usize| data.get(at + c).copied().unwrap_or(0);
        let rgb = match frame.meta.format {
            PixelFormat::Gray8 => [px(0); 3],
            PixelFormat::Rgb24 => [px(0), px(1), px(2)],
            PixelFormat::Bgr24 => [px(2), px(1), px(0)],
        };

        if adjust.show_saturation && rgb.contains(&u8::MAX) {
            return Rgb([255, 0, 0]);
        }
        if adjust.is_identity() {
            Rgb(rgb)
        } else {
            Rgb(rgb.map(|v| adjust.apply(v)))
        }
    })
}
