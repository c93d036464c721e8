//! SCRFD face detector via ONNX Runtime.
//!
//! Local pre-filter for the monitoring loop: "is there plausibly a face in
//! this frame, and where". Identity comparison happens remotely, so the
//! model's landmark outputs are ignored — only score and bbox tensors are
//! decoded.

use crate::types::{Detection, DetectionBox};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: u32 = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Cheap local face gate, run on every frame before any remote call.
pub trait LocalDetector {
    /// Detect candidate faces in a grayscale frame, sorted by descending
    /// confidence. An empty result means the frame should not be sent to
    /// the remote service at all.
    fn detect(&mut self, gray: &[u8], width: u32, height: u32)
        -> Result<Vec<Detection>, DetectorError>;
}

/// Mapping from letterboxed model coordinates back to frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let input = SCRFD_INPUT_SIZE as f32;
        let scale = (input / width as f32).min(input / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input - new_w) / 2.0,
            pad_y: (input - new_h) / 2.0,
        }
    }

    /// Map a point from model space back into the original frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(path = model_path, outputs = num_outputs, "loaded SCRFD model");

        // Standard SCRFD export order: [0-2] scores, [3-5] bboxes per stride
        // {8, 16, 32}; landmark tensors (if present) trail and are unused.
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides x score/bbox), got {num_outputs}"
            )));
        }

        Ok(Self { session })
    }

    /// Resize into the letterboxed model input and normalize to NCHW.
    fn preprocess(gray: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let img = GrayImage::from_raw(width, height, gray.to_vec()).ok_or_else(|| {
            DetectorError::BadFrame(format!(
                "buffer length {} does not match {width}x{height}",
                gray.len()
            ))
        })?;

        let letterbox = Letterbox::fit(width, height);
        let new_w = (width as f32 * letterbox.scale).round() as u32;
        let new_h = (height as f32 * letterbox.scale).round() as u32;
        let resized = imageops::resize(&img, new_w.max(1), new_h.max(1), FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Zeros are exactly the normalized pad value ((MEAN - MEAN) / STD).
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let x0 = letterbox.pad_x.floor() as usize;
        let y0 = letterbox.pad_y.floor() as usize;

        for (y, row) in resized.rows().enumerate() {
            for (x, pixel) in row.enumerate() {
                let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
                // Grayscale replicated into all three input channels.
                for c in 0..3 {
                    tensor[[0, c, y0 + y, x0 + x]] = normalized;
                }
            }
        }

        Ok((tensor, letterbox))
    }
}

impl LocalDetector for ScrfdDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = Self::preprocess(gray, width, height)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, deltas) = outputs[i + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            decode_stride(scores, deltas, stride, &letterbox, &mut candidates);
        }

        let mut faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(faces)
    }
}

/// Decode anchor-free distance regressions for one stride level.
///
/// Each grid cell carries `SCRFD_ANCHORS_PER_CELL` anchors at the cell
/// center; the bbox tensor holds [left, top, right, bottom] distances in
/// stride units.
fn decode_stride(
    scores: &[f32],
    deltas: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    out: &mut Vec<Detection>,
) {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = (grid_w * grid_h * SCRFD_ANCHORS_PER_CELL) as usize;
    let s = stride as f32;

    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(d) = deltas.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx as u32 / SCRFD_ANCHORS_PER_CELL;
        let cx = (cell % grid_w) as f32 * s;
        let cy = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
        let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

        out.push(Detection {
            bbox: DetectionBox {
                left: x1,
                top: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score,
        });
    }
}

/// Non-Maximum Suppression: drop detections overlapping a stronger one.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    'candidates: for det in detections {
        for kept in &keep {
            if iou(&det.bbox, &kept.bbox) > iou_threshold {
                continue 'candidates;
            }
        }
        keep.push(det);
    }
    keep
}

/// Intersection-over-Union of two boxes.
fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let x1 = a.left.max(b.left);
    let y1 = a.top.max(b.top);
    let x2 = (a.left + a.width).min(b.left + b.width);
    let y2 = (a.top + a.height).min(b.top + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
