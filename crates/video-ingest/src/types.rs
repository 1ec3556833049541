use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Decoded BGR frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    /// Position in the capture stream, assigned by the acquisition loop.
    /// Starts at 1; zero means the frame never went through a `FrameSource`.
    pub sequence: u64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Wrap a tightly packed BGR buffer, stamping it with the current wall clock.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * FrameFormat::Bgr8.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::Decode(format!(
                "BGR buffer holds {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        })
    }

    /// Solid-colour frame, handy for placeholders and tests.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Byte length implied by the frame geometry.
    pub fn expected_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * self.format.bytes_per_pixel()
    }

    /// BGR triple at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        self.data
            .get(offset..offset + 3)
            .map(|px| [px[0], px[1], px[2]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        if let Some(px) = self.data.get_mut(offset..offset + 3) {
            px.copy_from_slice(&bgr);
        }
    }
}

/// Transport used to reach a video source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device by index or path, or a video file.
    Device,
    /// Real-time streaming protocol feed decoded by ffmpeg.
    Rtsp,
    /// Pull-based multipart JPEG stream over HTTP.
    Mjpeg,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Mjpeg
        } else {
            SourceKind::Device
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Device => "device",
            SourceKind::Rtsp => "rtsp",
            SourceKind::Mjpeg => "mjpeg",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("frame grab failed: {0}")]
    Read(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("capture source closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    pub(crate) fn open(uri: &str, reason: impl Into<String>) -> Self {
        CaptureError::Open {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures raised before a source ever produced a session.
    pub fn is_open_error(&self) -> bool {
        matches!(self, CaptureError::Open { .. })
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_follows_scheme() {
        assert_eq!(SourceKind::from_uri("0"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("/dev/video2"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("rtsp://cam/stream"), SourceKind::Rtsp);
        assert_eq!(
            SourceKind::from_uri("http://192.168.1.20:81/stream"),
            SourceKind::Mjpeg
        );
        assert_eq!(SourceKind::from_uri("https://cam.local/mjpg"), SourceKind::Mjpeg);
    }

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("3"), Some(3));
        assert_eq!(parse_device_index("/dev/video12"), Some(12));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("clip.mp4"), None);
    }

    #[test]
    fn from_bgr_rejects_short_buffers() {
        let err = Frame::from_bgr(vec![0; 10], 4, 4).unwrap_err();
        assert!(matches!(err, CaptureError::Decode(_)));
        let frame = Frame::from_bgr(vec![0; 48], 4, 4).unwrap();
        assert_eq!(frame.expected_len(), 48);
    }

    #[test]
    fn pixel_accessors_stay_in_bounds() {
        let mut frame = Frame::filled(3, 2, [1, 2, 3]);
        frame.set_pixel(2, 1, [9, 8, 7]);
        frame.set_pixel(5, 5, [0, 0, 0]);
        assert_eq!(frame.pixel(2, 1), Some([9, 8, 7]));
        assert_eq!(frame.pixel(0, 0), Some([1, 2, 3]));
        assert_eq!(frame.pixel(3, 0), None);
    }
}
