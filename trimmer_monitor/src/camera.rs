use connect_vision::{Frame, FrameSource, VisionError};
use image::{DynamicImage, RgbImage};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};

/// A V4L / USB camera read through OpenCV.
pub struct CameraSource {
    index: i32,
    capture: VideoCapture,
    bgr: Mat,
    rgb: Mat,
}

impl CameraSource {
    pub fn open(index: i32) -> Result<Self, VisionError> {
        let capture = VideoCapture::new(index, videoio::CAP_ANY).map_err(camera_error)?;
        if !capture.is_opened().map_err(camera_error)? {
            return Err(VisionError::FrameSource(format!(
                "camera {index} could not be opened"
            )));
        }
        Ok(Self {
            index,
            capture,
            bgr: Mat::default(),
            rgb: Mat::default(),
        })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Frame, VisionError> {
        let grabbed = self.capture.read(&mut self.bgr).map_err(camera_error)?;
        if !grabbed || self.bgr.empty() {
            return Err(VisionError::FrameSource(format!(
                "camera {} returned no frame",
                self.index
            )));
        }

        // OpenCV delivers BGR; the detector expects RGB.
        imgproc::cvt_color(&self.bgr, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(camera_error)?;
        let width = self.rgb.cols() as u32;
        let height = self.rgb.rows() as u32;
        let data = self.rgb.data_bytes().map_err(camera_error)?.to_vec();
        let image = RgbImage::from_raw(width, height, data).ok_or_else(|| {
            VisionError::FrameSource(format!(
                "camera {} frame buffer does not match {width}x{height}",
                self.index
            ))
        })?;

        Ok(Frame::now(DynamicImage::ImageRgb8(image)))
    }
}

fn camera_error(err: opencv::Error) -> VisionError {
    VisionError::FrameSource(err.to_string())
}
