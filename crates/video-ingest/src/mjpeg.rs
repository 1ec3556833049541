//! Pull-based MJPEG over HTTP: frames are cut out of the byte stream by their
//! JPEG start/end markers.

use std::{
    io::{BufReader, Read},
    time::Duration,
};

use reqwest::blocking::{Client, Response};
use tracing::{debug, trace};

use crate::{
    source::{CaptureSession, Connector},
    types::{CaptureError, Frame},
};

const CHUNK_SIZE: usize = 16 * 1024;
/// Bytes held while waiting for a marker before the partial data is dropped.
const MAX_PENDING: usize = 4 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for response headers and on every body read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegConnector {
    uri: String,
    read_timeout: Duration,
    client: Option<Client>,
}

impl MjpegConnector {
    pub fn new(uri: &str) -> Self {
        Self::with_read_timeout(uri, DEFAULT_READ_TIMEOUT)
    }

    /// A stream that stays silent for `read_timeout` fails the connect or the
    /// current grab, which sends the acquisition loop into reconnect.
    pub fn with_read_timeout(uri: &str, read_timeout: Duration) -> Self {
        Self {
            uri: uri.to_string(),
            read_timeout,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&Client, CaptureError> {
        if self.client.is_none() {
            let client = Client::builder()
                .connect_timeout(CONNECT_TIMEOUT.min(self.read_timeout))
                .timeout(self.read_timeout)
                .build()
                .map_err(|err| CaptureError::open(&self.uri, err.to_string()))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| CaptureError::open(&self.uri, "http client unavailable"))
    }
}

impl Connector for MjpegConnector {
    fn kind(&self) -> &'static str {
        "mjpeg"
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }

    fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let uri = self.uri.clone();
        let response = self
            .client()?
            .get(&uri)
            .send()
            .map_err(|err| CaptureError::open(&uri, err.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptureError::open(
                &uri,
                format!("stream responded with status {}", response.status()),
            ));
        }
        debug!(uri = %uri, "mjpeg stream connected");
        Ok(Box::new(MjpegSession::<BufReader<Response>>::new(
            BufReader::new(response),
        )))
    }

    fn paced(&self) -> bool {
        false
    }
}

/// Reassembles JPEG images from any byte reader.
pub struct MjpegSession<R> {
    reader: R,
    scanner: FrameScanner,
    chunk: Box<[u8; CHUNK_SIZE]>,
}

impl<R: Read + Send> MjpegSession<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scanner: FrameScanner::default(),
            chunk: Box::new([0u8; CHUNK_SIZE]),
        }
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        loop {
            if let Some(jpeg) = self.scanner.next_frame()? {
                return Ok(jpeg);
            }
            match self.reader.read(&mut self.chunk[..]) {
                Ok(0) => return Err(CaptureError::Closed),
                Ok(n) => {
                    trace!(bytes = n, "mjpeg chunk");
                    self.scanner.push(&self.chunk[..n]);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(CaptureError::Read(err.to_string())),
            }
        }
    }
}

impl<R: Read + Send> CaptureSession for MjpegSession<R> {
    fn grab(&mut self) -> Result<Frame, CaptureError> {
        let jpeg = self.next_jpeg()?;
        decode_jpeg(&jpeg)
    }
}

/// Decode a JPEG into a packed BGR frame.
pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame, CaptureError> {
    let rgb = image::load_from_memory(bytes)
        .map_err(|err| CaptureError::Decode(err.to_string()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = rgb.into_raw();
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Frame::from_bgr(data, width, height)
}

/// Incremental SOI/EOI scanner over a bounded buffer.
///
/// Once a start marker is found it sits at `buffer[0]` and `scanned` records
/// how far the end-marker search has already gone, so each byte is inspected
/// a bounded number of times.
#[derive(Debug, Default)]
struct FrameScanner {
    buffer: Vec<u8>,
    /// Zero while no start marker is anchored.
    scanned: usize,
}

impl FrameScanner {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.scanned == 0 {
            let Some(start) = find_marker(&self.buffer, &SOI) else {
                if self.buffer.last() == Some(&SOI[0]) {
                    // Keep a trailing 0xFF in case the marker straddles two reads.
                    let keep = self.buffer.len() - 1;
                    self.buffer.drain(..keep);
                } else {
                    self.buffer.clear();
                }
                return Ok(None);
            };
            self.buffer.drain(..start);
            self.scanned = SOI.len();
        }

        // Step back one byte so an end marker split across reads is found.
        let from = self.scanned.saturating_sub(1).max(SOI.len());
        if let Some(offset) = find_marker(&self.buffer[from..], &EOI) {
            let frame_end = from + offset + EOI.len();
            let frame: Vec<u8> = self.buffer.drain(..frame_end).collect();
            self.scanned = 0;
            return Ok(Some(frame));
        }

        if self.buffer.len() > MAX_PENDING {
            let dropped = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(CaptureError::Decode(format!(
                "jpeg exceeded {MAX_PENDING} bytes without an end marker ({dropped} dropped)"
            )));
        }
        self.scanned = self.buffer.len();
        Ok(None)
    }
}

fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    buffer
        .windows(marker.len())
        .position(|window| window == marker)
}
