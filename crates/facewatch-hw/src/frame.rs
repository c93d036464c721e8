//! Frame type and image processing — YUYV conversion, JPEG encoding, overlay drawing.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// JPEG quality for frames shipped to the remote verification service.
const JPEG_QUALITY: u8 = 85;

/// A captured grayscale camera frame.
///
/// Produced once per monitoring tick and dropped at the end of the
/// iteration; frames are never retained across ticks.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    /// Encode the frame as a grayscale JPEG for the remote detect call.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .encode(&self.data, self.width, self.height, ExtendedColorType::L8)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Draw a 2-pixel rectangle outline into a grayscale buffer.
///
/// Coordinates outside the frame are clipped. Used only for the preview
/// overlay; detection and verification never read annotated pixels.
pub fn draw_box(gray: &mut [u8], width: u32, height: u32, left: i64, top: i64, box_w: i64, box_h: i64) {
    const OUTLINE: i64 = 2;
    const INK: u8 = 255;

    let w = width as i64;
    let h = height as i64;
    let right = left + box_w;
    let bottom = top + box_h;

    let mut put = |x: i64, y: i64| {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            gray[(y * w + x) as usize] = INK;
        }
    };

    for t in 0..OUTLINE {
        for x in left..=right {
            put(x, top + t);
            put(x, bottom - t);
        }
        for y in top..=bottom {
            put(left + t, y);
            put(right - t, y);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_to_grayscale_4x2() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg_magic() {
        let f = frame(vec![128u8; 64 * 48], 64, 48);
        let jpeg = f.to_jpeg().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
    }

    #[test]
    fn test_draw_box_marks_corners() {
        let mut gray = vec![0u8; 100 * 100];
        draw_box(&mut gray, 100, 100, 10, 20, 30, 40);
        assert_eq!(gray[20 * 100 + 10], 255); // top-left
        assert_eq!(gray[20 * 100 + 40], 255); // top-right
        assert_eq!(gray[60 * 100 + 10], 255); // bottom-left
        // interior untouched
        assert_eq!(gray[40 * 100 + 25], 0);
    }

    #[test]
    fn test_draw_box_clips_out_of_bounds() {
        let mut gray = vec![0u8; 10 * 10];
        // box extends past every edge; must not panic
        draw_box(&mut gray, 10, 10, -5, -5, 30, 30);
    }
}
