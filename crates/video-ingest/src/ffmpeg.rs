//! ffmpeg subprocess backend: local devices, video files and RTSP feeds are
//! decoded to raw `bgr24` on the child's stdout.

use std::{
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    time::Duration,
};

use tracing::debug;

use crate::{
    source::{CaptureSession, CaptureSettings, Connector},
    types::{CaptureError, Frame, SourceKind, parse_device_index},
};

/// RTSP socket timeout handed to ffmpeg; a silent camera makes the child exit.
const RTSP_IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FfmpegConnector {
    uri: String,
    kind: SourceKind,
    settings: CaptureSettings,
}

impl FfmpegConnector {
    pub fn new(uri: &str, kind: SourceKind, settings: &CaptureSettings) -> Self {
        Self {
            uri: uri.to_string(),
            kind,
            settings: settings.clone(),
        }
    }

    /// Resolve the input the way ffmpeg expects it on this platform.
    fn input(&self) -> Result<(Option<&'static str>, String), CaptureError> {
        if self.kind == SourceKind::Rtsp {
            return Ok((None, self.uri.clone()));
        }
        if let Some(index) = parse_device_index(&self.uri) {
            return device_input(index).ok_or_else(|| {
                CaptureError::open(&self.uri, format!("capture device #{index} not present"))
            });
        }
        if !Path::new(&self.uri).exists() {
            return Err(CaptureError::open(&self.uri, "no such file or device"));
        }
        let format = self.uri.starts_with("/dev/video").then_some(V4L_FORMAT);
        Ok((format, self.uri.clone()))
    }

    fn command(&self) -> Result<Command, CaptureError> {
        let (format, input) = self.input()?;
        let scale_arg = format!("scale={}:{}", self.settings.width, self.settings.height);

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        match self.kind {
            SourceKind::Rtsp => {
                cmd.arg("-rtsp_transport")
                    .arg("tcp")
                    .arg("-fflags")
                    .arg("nobuffer")
                    .arg("-flags")
                    .arg("low_delay")
                    .arg("-timeout")
                    .arg(RTSP_IO_TIMEOUT.as_micros().to_string());
            }
            _ => {
                if let Some(format) = format {
                    cmd.arg("-f")
                        .arg(format)
                        .arg("-framerate")
                        .arg(format!("{}", self.settings.target_fps))
                        .arg("-video_size")
                        .arg(format!("{}x{}", self.settings.width, self.settings.height));
                }
            }
        }

        cmd.arg("-i")
            .arg(&input)
            .arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        Ok(cmd)
    }
}

#[cfg(target_os = "macos")]
const V4L_FORMAT: &str = "avfoundation";
#[cfg(not(target_os = "macos"))]
const V4L_FORMAT: &str = "v4l2";

#[cfg(target_os = "macos")]
fn device_input(index: i32) -> Option<(Option<&'static str>, String)> {
    Some((Some(V4L_FORMAT), format!("{index}")))
}

#[cfg(not(target_os = "macos"))]
fn device_input(index: i32) -> Option<(Option<&'static str>, String)> {
    let path = format!("/dev/video{index}");
    Path::new(&path)
        .exists()
        .then(|| (Some(V4L_FORMAT), path))
}

impl Connector for FfmpegConnector {
    fn kind(&self) -> &'static str {
        self.kind.label()
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }

    fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let mut cmd = self.command()?;
        let mut child = cmd
            .spawn()
            .map_err(|err| CaptureError::open(&self.uri, format!("failed to spawn ffmpeg: {err}")))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::open(&self.uri, "failed to capture ffmpeg stdout"));
        };

        let mut session = FfmpegSession {
            child,
            stdout,
            width: self.settings.width,
            height: self.settings.height,
            pending: None,
        };
        // The device only counts as open once it has produced a frame.
        let first = session
            .read_frame()
            .map_err(|err| CaptureError::open(&self.uri, err.to_string()))?;
        session.pending = Some(first);
        debug!(uri = %self.uri, "ffmpeg produced first frame");
        Ok(Box::new(session))
    }

    fn paced(&self) -> bool {
        self.kind != SourceKind::Rtsp
    }
}

struct FfmpegSession {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    pending: Option<Frame>,
}

impl FfmpegSession {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let frame_bytes = (self.width as usize) * (self.height as usize) * 3;
        let mut buffer = vec![0u8; frame_bytes];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => Frame::from_bgr(buffer, self.width, self.height),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::Closed),
            Err(err) => Err(CaptureError::Read(err.to_string())),
        }
    }
}

impl CaptureSession for FfmpegSession {
    fn grab(&mut self) -> Result<Frame, CaptureError> {
        match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.read_frame(),
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_an_open_error() {
        let mut connector = FfmpegConnector::new(
            "/dev/video-definitely-missing",
            SourceKind::Device,
            &CaptureSettings::default(),
        );
        let err = connector.connect().err().expect("missing device");
        assert!(err.is_open_error());
    }

    #[test]
    fn rtsp_streams_are_not_paced() {
        let settings = CaptureSettings::default();
        let rtsp = FfmpegConnector::new("rtsp://cam/live", SourceKind::Rtsp, &settings);
        let device = FfmpegConnector::new("0", SourceKind::Device, &settings);
        assert!(!rtsp.paced());
        assert!(device.paced());
        assert_eq!(rtsp.kind(), "rtsp");
    }

    #[test]
    fn rtsp_input_carries_a_socket_timeout() {
        let settings = CaptureSettings::default();
        let connector = FfmpegConnector::new("rtsp://cam/live", SourceKind::Rtsp, &settings);
        let cmd = connector.command().unwrap();
        let args: Vec<_> = cmd.get_args().map(|arg| arg.to_string_lossy().into_owned()).collect();

        let at = args.iter().position(|arg| arg == "-timeout").expect("-timeout flag");
        assert_eq!(args[at + 1], "10000000");
        let input = args.iter().position(|arg| arg == "-i").unwrap();
        assert!(at < input, "input options must precede -i");
    }
}
