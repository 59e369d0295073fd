use crate::core_modules::roi::Roi;
use thiserror::Error;

/// Every failure the monitoring core can surface.
///
/// Only `PersistenceUnavailable` is transient. The monitor retries it on a
/// fixed period and never lets it end a machine's loop.
#[derive(Debug, Error)]
pub enum VisionError {
    /// The configured ROI does not fit inside the frame it is applied to.
    #[error("roi {roi} does not fit in a {frame_width}x{frame_height} frame")]
    InvalidRoi {
        roi: Roi,
        frame_width: u32,
        frame_height: u32,
    },

    /// The database could not be reached, timed out, or rejected a write.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// A presence edge arrived that makes no sense for the current cycle state.
    #[error("unrecognized transition: {edge} while {state}")]
    UnrecognizedTransition { state: String, edge: String },

    /// The frame source has no more frames.
    #[error("frame source exhausted")]
    FrameSourceExhausted,

    /// The frame source failed to produce a frame. The monitor retries it.
    #[error("frame source failed: {0}")]
    FrameSource(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VisionError::PersistenceUnavailable(_))
    }
}

impl From<sqlx::Error> for VisionError {
    fn from(err: sqlx::Error) -> Self {
        VisionError::PersistenceUnavailable(err.to_string())
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        VisionError::FrameSource(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for VisionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        VisionError::PersistenceUnavailable("operation timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_persistence_failures_are_transient() {
        assert!(VisionError::PersistenceUnavailable("down".into()).is_transient());
        assert!(!VisionError::FrameSourceExhausted.is_transient());
        assert!(
            !VisionError::InvalidRoi {
                roi: Roi::new(0, 0, 10, 10),
                frame_width: 5,
                frame_height: 5,
            }
            .is_transient()
        );
    }

    #[test]
    fn invalid_roi_message_names_the_rectangle() {
        let err = VisionError::InvalidRoi {
            roi: Roi::new(600, 400, 80, 100),
            frame_width: 640,
            frame_height: 480,
        };
        assert_eq!(
            err.to_string(),
            "roi (600, 400, 80x100) does not fit in a 640x480 frame"
        );
    }
}
