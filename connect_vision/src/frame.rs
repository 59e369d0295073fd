// THEORY:
// The `frame` module is the seam between the monitoring core and whatever
// produces pictures. The core never talks to a camera driver directly; it pulls
// `Frame`s from a `FrameSource` and stops cleanly when the source says it has
// nothing left (`FrameSourceExhausted`), which is reported separately from a
// genuine acquisition failure (`FrameSource`).

use crate::error::VisionError;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};

/// A single captured image plus the moment it was captured.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Stamps `image` with the current wall-clock time.
    pub fn now(image: DynamicImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }
}

/// Anything that can hand the monitor a steady stream of frames.
pub trait FrameSource: Send {
    /// Blocks until the next frame is available.
    ///
    /// Returns `Err(VisionError::FrameSourceExhausted)` at end of input.
    fn next_frame(&mut self) -> Result<Frame, VisionError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, VisionError> {
        (**self).next_frame()
    }
}

/// Adapts any iterator of frames into a `FrameSource`. Used for replay and tests.
pub struct FrameIter<I> {
    frames: I,
}

impl<I> FrameIter<I>
where
    I: Iterator<Item = Frame>,
{
    pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl<I> FrameSource for FrameIter<I>
where
    I: Iterator<Item = Frame> + Send,
{
    fn next_frame(&mut self) -> Result<Frame, VisionError> {
        self.frames.next().ok_or(VisionError::FrameSourceExhausted)
    }
}

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Plays back a directory of still images in file-name order.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    position: usize,
    repeat: bool,
}

impl ImageSequence {
    pub fn open(directory: impl AsRef<Path>, repeat: bool) -> Result<Self, VisionError> {
        let directory = directory.as_ref();
        let entries = fs::read_dir(directory).map_err(|err| {
            VisionError::FrameSource(format!("cannot read {}: {err}", directory.display()))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(VisionError::FrameSource(format!(
                "no images found in {}",
                directory.display()
            )));
        }

        Ok(Self {
            paths,
            position: 0,
            repeat,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Frame, VisionError> {
        if self.position >= self.paths.len() {
            if !self.repeat {
                return Err(VisionError::FrameSourceExhausted);
            }
            self.position = 0;
        }
        let path = &self.paths[self.position];
        self.position += 1;
        let image = image::open(path)?;
        Ok(Frame::now(image))
    }
}
