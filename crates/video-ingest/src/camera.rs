//! OpenCV `videoio` backend for local capture devices and video files.

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::debug;

use crate::{
    source::{CaptureSession, CaptureSettings, Connector},
    types::{CaptureError, Frame, parse_device_index},
};

pub struct OpenCvConnector {
    uri: String,
    settings: CaptureSettings,
}

impl OpenCvConnector {
    pub fn new(uri: &str, settings: &CaptureSettings) -> Self {
        Self {
            uri: uri.to_string(),
            settings: settings.clone(),
        }
    }
}

impl Connector for OpenCvConnector {
    fn kind(&self) -> &'static str {
        "device"
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }

    fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, &self.settings);
        Ok(Box::new(OpenCvSession {
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            width: self.settings.width as i32,
            height: self.settings.height as i32,
        }))
    }
}

struct OpenCvSession {
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    width: i32,
    height: i32,
}

fn cv_err(err: opencv::Error) -> CaptureError {
    CaptureError::Read(err.to_string())
}

impl CaptureSession for OpenCvSession {
    fn grab(&mut self) -> Result<Frame, CaptureError> {
        if !self.cap.read(&mut self.frame).map_err(cv_err)? {
            return Err(CaptureError::Read("device returned no frame".into()));
        }
        let size = self.frame.size().map_err(cv_err)?;
        if size.width <= 0 {
            return Err(CaptureError::Read("empty frame".into()));
        }

        let working = if size.width != self.width || size.height != self.height {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: self.width,
                    height: self.height,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(cv_err)?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working.data_bytes().map_err(cv_err)?.to_vec();
        Frame::from_bgr(data, self.width as u32, self.height as u32)
    }
}

/// Open a camera by index, falling back to treating the URI as a file path.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    let open_err = |err: opencv::Error| CaptureError::open(uri, err.to_string());

    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(open_err)? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    debug!(index, backend, error = %err, "device open attempt failed");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(open_err)? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                debug!(backend, error = %err, "file open attempt failed");
            }
        }
    }

    Err(CaptureError::open(uri, "device could not be opened"))
}

fn configure_camera(cap: &mut VideoCapture, settings: &CaptureSettings) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, settings.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, settings.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.target_fps);
}
