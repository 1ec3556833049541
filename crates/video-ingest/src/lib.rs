//! Frame acquisition for the vision pipeline.
//!
//! A [`FrameSource`] owns one video source and a background thread that keeps
//! the newest frame available, reconnecting whenever the source drops.

#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod mjpeg;
pub mod source;
pub mod types;

pub use source::{CaptureSession, CaptureSettings, Connector, FrameSource, SourceStats};
pub use types::{CaptureError, Frame, FrameFormat, SourceKind};

/// Pick the capture backend for `uri`.
pub fn connector_for(
    uri: &str,
    settings: &CaptureSettings,
) -> Result<Box<dyn Connector>, CaptureError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(CaptureError::Open {
            uri: String::new(),
            reason: "empty source".into(),
        });
    }
    let connector: Box<dyn Connector> = match SourceKind::from_uri(uri) {
        SourceKind::Mjpeg => Box::new(mjpeg::MjpegConnector::new(uri)),
        SourceKind::Rtsp => Box::new(ffmpeg::FfmpegConnector::new(uri, SourceKind::Rtsp, settings)),
        SourceKind::Device => device_connector(uri, settings),
    };
    Ok(connector)
}

#[cfg(feature = "opencv")]
fn device_connector(uri: &str, settings: &CaptureSettings) -> Box<dyn Connector> {
    Box::new(camera::OpenCvConnector::new(uri, settings))
}

#[cfg(not(feature = "opencv"))]
fn device_connector(uri: &str, settings: &CaptureSettings) -> Box<dyn Connector> {
    Box::new(ffmpeg::FfmpegConnector::new(uri, SourceKind::Device, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_follows_uri_scheme() {
        let settings = CaptureSettings::default();
        assert_eq!(connector_for("http://cam:81/stream", &settings).unwrap().kind(), "mjpeg");
        assert_eq!(connector_for("rtsp://cam/live", &settings).unwrap().kind(), "rtsp");
        assert_eq!(connector_for("0", &settings).unwrap().kind(), "device");
        assert!(connector_for("  ", &settings).is_err());
    }

    #[test]
    fn open_on_invalid_source_fails_fast() {
        let err = FrameSource::open("/nonexistent/camera/feed", CaptureSettings::default())
            .err()
            .expect("invalid source");
        assert!(err.is_open_error());
    }
}
