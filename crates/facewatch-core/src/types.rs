use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in frame coordinates.
///
/// Purely descriptive: boxes feed the preview overlay and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// One candidate face from the local detector.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: DetectionBox,
    pub confidence: f32,
}

/// Outcome of one remote verification call. Never persisted.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Service-reported match confidence in [0, 1].
    pub confidence: f32,
    /// Best-matching face rectangle, when the service found a face at all.
    pub matched_box: Option<DetectionBox>,
}

impl VerificationResult {
    /// A definite non-match, used when the remote detect step finds no face.
    pub fn no_match() -> Self {
        Self {
            confidence: 0.0,
            matched_box: None,
        }
    }

    pub fn is_match(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}
