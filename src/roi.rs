//! Region of interest in native sensor pixels

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub left_edge: u32,
    pub top_edge: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(left_edge: u32, top_edge: u32, width: u32, height: u32) -> Self {
        Self {
            left_edge,
            top_edge,
            width,
            height,
        }
    }

    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Convert a box drawn in display pixels to native pixels and trim its
    /// right and bottom edges to the frame.
    pub fn from_display(
        display: Roi,
        window_scale: f64,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let scale = if window_scale > 0.0 { window_scale } else { 1.0 };
        let native = |v: u32| (f64::from(v) / scale).round() as u32;

        Roi::new(
            native(display.left_edge),
            native(display.top_edge),
            native(display.width),
            native(display.height),
        )
        .clamped(frame_width, frame_height)
    }

    pub fn clamped(self, frame_width: u32, frame_height: u32) -> Self {
        let left_edge = self.left_edge.min(frame_width);
        let top_edge = self.top_edge.min(frame_height);
        Roi {
            left_edge,
            top_edge,
            width: self.width.min(frame_width - left_edge),
            height: self.height.min(frame_height - top_edge),
        }
    }

    /// The same box in display pixels.
    pub fn to_display(self, window_scale: f64) -> Self {
        let display = |v: u32| (f64::from(v) * window_scale).round() as u32;
        Roi::new(
            display(self.left_edge),
            display(self.top_edge),
            display(self.width),
            display(self.height),
        )
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.left_edge, self.top_edge, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_width_past_right_edge() {
        let roi = Roi::from_display(Roi::new(600, 10, 100, 50), 1.0, 640, 480);
        assert_eq!(roi, Roi::new(600, 10, 40, 50));
    }

    #[test]
    fn trims_height_past_bottom_edge() {
        let roi = Roi::from_display(Roi::new(0, 450, 10, 100), 1.0, 640, 480);
        assert_eq!(roi, Roi::new(0, 450, 10, 30));
    }

    #[test]
    fn divides_by_window_scale() {
        let roi = Roi::from_display(Roi::new(100, 50, 201, 99), 0.5, 640, 480);
        assert_eq!(roi, Roi::new(200, 100, 402, 198));
    }

    #[test]
    fn box_outside_frame_collapses() {
        let roi = Roi::from_display(Roi::new(700, 500, 10, 10), 1.0, 640, 480);
        assert_eq!(roi, Roi::new(640, 480, 0, 0));
    }

    #[test]
    fn display_round_trip_and_format() {
        let roi = Roi::new(10, 20, 30, 40);
        assert_eq!(roi.to_display(2.0), Roi::new(20, 40, 60, 80));
        assert_eq!(roi.to_string(), "[10, 20, 30, 40]");
    }
}
