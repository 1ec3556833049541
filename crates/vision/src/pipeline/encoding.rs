//! JPEG encoding of published frames.

use anyhow::{Context, Result, ensure};
use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

/// Encode a BGR frame as JPEG at `quality` (clamped to `1..=100`).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    ensure!(!frame.is_empty(), "cannot encode an empty frame");
    let expected = frame.expected_len();
    ensure!(
        frame.data.len() >= expected,
        "frame buffer holds {} bytes, expected {expected}",
        frame.data.len()
    );

    let mut rgb = Vec::with_capacity(expected);
    for px in frame.data[..expected].chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_a_decodable_jpeg() {
        let frame = Frame::filled(32, 16, [0, 0, 255]);
        let jpeg = encode_jpeg(&frame, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 16));
        let px = decoded.get_pixel(8, 8);
        assert!(px[0] > 200 && px[2] < 60);
    }

    #[test]
    fn rejects_empty_frames() {
        let frame = Frame::filled(0, 0, [0, 0, 0]);
        assert!(encode_jpeg(&frame, 80).is_err());
    }
}
