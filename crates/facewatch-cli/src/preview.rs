//! Preview sink — publishes annotated frames for external viewers.

use facewatch_core::DetectionBox;
use facewatch_hw::frame::draw_box;
use facewatch_hw::Frame;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("failed to write preview: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode preview: {0}")]
    Encode(String),
}

/// Receives the current frame once per evaluated tick when the display
/// overlay is enabled. Sinks never influence trigger logic; failures are
/// logged by the caller and absorbed.
pub trait FrameSink {
    fn publish(&mut self, frame: &Frame, matched: Option<&DetectionBox>)
        -> Result<(), PreviewError>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn publish(
        &mut self,
        frame: &Frame,
        matched: Option<&DetectionBox>,
    ) -> Result<(), PreviewError> {
        (**self).publish(frame, matched)
    }
}

/// Sink used when the overlay is disabled.
pub struct NullSink;

impl FrameSink for NullSink {
    fn publish(
        &mut self,
        _frame: &Frame,
        _matched: Option<&DetectionBox>,
    ) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Writes the latest annotated frame as a PNG, replaced atomically so a
/// viewer watching the file never sees a torn image.
pub struct PreviewWriter {
    path: PathBuf,
}

impl PreviewWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameSink for PreviewWriter {
    fn publish(
        &mut self,
        frame: &Frame,
        matched: Option<&DetectionBox>,
    ) -> Result<(), PreviewError> {
        let mut gray = frame.data.clone();
        if let Some(b) = matched {
            draw_box(
                &mut gray,
                frame.width,
                frame.height,
                b.left as i64,
                b.top as i64,
                b.width as i64,
                b.height as i64,
            );
        }

        let img = image::GrayImage::from_raw(frame.width, frame.height, gray)
            .ok_or_else(|| PreviewError::Encode("buffer/dimension mismatch".into()))?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        img.save_with_format(&tmp, image::ImageFormat::Png)
            .map_err(|e| PreviewError::Encode(e.to_string()))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            data: vec![64; 32 * 32],
            width: 32,
            height: 32,
            timestamp: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_preview_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut sink = PreviewWriter::new(&path);

        sink.publish(&frame(), None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_preview_with_box_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut sink = PreviewWriter::new(&path);

        sink.publish(&frame(), None).unwrap();
        let first = std::fs::read(&path).unwrap();

        let matched = DetectionBox {
            left: 4.0,
            top: 4.0,
            width: 12.0,
            height: 12.0,
        };
        sink.publish(&frame(), Some(&matched)).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_ne!(first, second, "annotated frame should differ");
    }

    #[test]
    fn test_null_sink_is_noop() {
        assert!(NullSink.publish(&frame(), None).is_ok());
    }
}
