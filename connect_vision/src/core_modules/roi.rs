// THEORY:
// The `roi` module holds the two small data containers that tell the detector
// *where* to look and *what counts* as a part. Both are owned by the calibration
// side of the system (a config file or the machine's database row) and are
// read-only while a monitoring session runs.
//
// A `Roi` is deliberately not clamped to the frame. A rectangle that pokes past
// the frame edge is a calibration mistake, and the detector reports it as
// `InvalidRoi` instead of quietly analysing a smaller area.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A rectangular region of interest in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when the rectangle is non-empty and lies entirely inside a
    /// `frame_width` x `frame_height` frame.
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        // Widen before adding so a huge ROI cannot wrap around.
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        right <= frame_width as u64 && bottom <= frame_height as u64
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Everything the presence detector needs for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub roi: Roi,
    /// Luma cut-off. Pixels strictly brighter than this are foreground.
    pub threshold: u8,
    /// Minimum pixel area of the largest foreground region for a part to count as present.
    pub min_area: u32,
}

impl Default for DetectionConfig {
    // Factory defaults of the trimmer stations: an 80x80 box over the chuck.
    fn default() -> Self {
        Self {
            roi: Roi::new(280, 260, 80, 80),
            threshold: 100,
            min_area: 500,
        }
    }
}
