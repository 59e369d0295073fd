// THEORY:
// The `PresenceDetector` answers one question per frame: "is there a part in the
// chuck right now?" It is a stateless utility, like the blob finder it descends
// from. It takes one frame and one `DetectionConfig` and returns one
// `PresenceSample`. It has no memory of previous frames; smoothing over time is
// the job of the cycle state machine.
//
// Algorithm steps:
// 1.  **Crop**: The frame is cut down to the ROI. An ROI that does not fit inside
//     the frame is a calibration error and is reported as `InvalidRoi`.
// 2.  **Intensity**: The crop is converted to single-channel luma (Rec. 601).
// 3.  **Binarize**: A pixel is foreground when its luma is strictly greater than
//     the threshold. Parts on the trimmers are bright metal against a dark chuck,
//     so "brighter than threshold" is the foreground convention everywhere.
// 4.  **Region growing**: Foreground pixels are grouped into 8-connected regions
//     with an iterative flood fill over a `visited` mask. The area of a region is
//     its pixel count.
// 5.  **Decision**: `present = largest_area >= min_area`. An all-background crop
//     is a normal, empty chuck and yields `present = min_area == 0`, area 0.

use crate::core_modules::roi::DetectionConfig;
use chrono::{DateTime, Utc};

/// One frame's worth of presence information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSample {
    /// When the frame was captured.
    pub timestamp: DateTime<Utc>,
    pub present: bool,
    /// Pixel area of the largest foreground region inside the ROI.
    pub measured_area: u32,
}

pub mod presence_detector {
    use super::*;
    use crate::error::VisionError;
    use crate::frame::Frame;
    use image::GrayImage;

    /// The 8 neighbours of a pixel, diagonals included.
    const NEIGHBOURS: [(i64, i64); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (-1, 0),
        (1, 0),
        (-1, 1),
        (0, 1),
        (1, 1),
    ];

    /// Converts one frame into a presence sample for the given config.
    pub fn detect(frame: &Frame, config: &DetectionConfig) -> Result<PresenceSample, VisionError> {
        let roi = config.roi;
        let (frame_width, frame_height) = (frame.image.width(), frame.image.height());
        if !roi.fits_within(frame_width, frame_height) {
            return Err(VisionError::InvalidRoi {
                roi,
                frame_width,
                frame_height,
            });
        }

        let gray = frame
            .image
            .crop_imm(roi.x, roi.y, roi.width, roi.height)
            .to_luma8();
        let measured_area = largest_region_area(&gray, config.threshold);

        Ok(PresenceSample {
            timestamp: frame.captured_at,
            present: measured_area >= config.min_area,
            measured_area,
        })
    }

    /// Returns the pixel count of the largest 8-connected region of pixels
    /// brighter than `threshold`.
    pub fn largest_region_area(gray: &GrayImage, threshold: u8) -> u32 {
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let luma = gray.as_raw();

        let is_foreground = |index: usize| luma[index] > threshold;

        let mut visited = vec![false; width * height];
        let mut stack: Vec<usize> = Vec::new();
        let mut largest = 0u32;

        for seed in 0..width * height {
            if visited[seed] || !is_foreground(seed) {
                continue;
            }

            // Grow a new region from this unvisited foreground pixel.
            visited[seed] = true;
            stack.push(seed);
            let mut area = 0u32;

            while let Some(current) = stack.pop() {
                area += 1;
                let cx = (current % width) as i64;
                let cy = (current / width) as i64;

                for (dx, dy) in NEIGHBOURS {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let neighbour = ny as usize * width + nx as usize;
                    if !visited[neighbour] && is_foreground(neighbour) {
                        visited[neighbour] = true;
                        stack.push(neighbour);
                    }
                }
            }

            largest = largest.max(area);
        }

        largest
    }
}
