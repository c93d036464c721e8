//! Reference model lifecycle — enrollment, persistence, staleness refresh.

use crate::types::DetectionBox;
use crate::verifier::{DetectPayload, FaceApiClient, FaceApiError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Remote fingerprints are valid for 24 hours on the service side; after
/// that the source image must be re-detected.
const FINGERPRINT_TTL_HOURS: i64 = 24;

/// The enrolled identity: an opaque remote fingerprint plus the metadata
/// needed to refresh it. Created once by enrollment, immutable afterwards
/// except for fingerprint refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceModel {
    /// Opaque face identifier issued by the remote detect call.
    pub fingerprint: String,
    pub enrolled_at: DateTime<Utc>,
    /// Path or URL the model was enrolled from; retained so a stale
    /// fingerprint can be re-detected without re-asking the caller.
    pub source_image: String,
    #[serde(default)]
    pub rectangle: Option<DetectionBox>,
    /// Face attributes reported at enrollment (age, glasses, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

impl ReferenceModel {
    /// A model with no fingerprint must never reach verification.
    pub fn is_valid(&self) -> bool {
        !self.fingerprint.is_empty()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.enrolled_at > Duration::hours(FINGERPRINT_TTL_HOURS)
    }
}

/// Enrollment image reference — a local file or an HTTP(S) URL.
#[derive(Debug, Clone)]
pub enum ImageRef {
    Url(String),
    Path(PathBuf),
}

impl ImageRef {
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            ImageRef::Url(input.to_string())
        } else {
            ImageRef::Path(PathBuf::from(input))
        }
    }

    /// URLs are passed through for the service to fetch; local files are
    /// read and shipped as raw bytes.
    fn to_payload(&self) -> Result<DetectPayload, EnrollError> {
        match self {
            ImageRef::Url(url) => Ok(DetectPayload::Url(url.clone())),
            ImageRef::Path(path) => Ok(DetectPayload::Bytes(std::fs::read(path)?)),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Url(url) => f.write_str(url),
            ImageRef::Path(path) => f.write_str(&path.to_string_lossy()),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("failed to read enrollment image: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Api(#[from] FaceApiError),
}

/// Detect the face in `image` and build the reference identity from it.
///
/// Zero detected faces is fatal here — enrollment has no comparison
/// target, so there is nothing sensible to store.
pub async fn enroll(client: &FaceApiClient, image: &ImageRef) -> Result<ReferenceModel, EnrollError> {
    let faces = client.detect(image.to_payload()?).await?;

    // First face in response order is the enrolled identity.
    let face = faces.into_iter().next().ok_or(EnrollError::NoFaceDetected)?;

    tracing::info!(source = %image, "enrolled reference face");
    Ok(ReferenceModel {
        fingerprint: face.face_id,
        enrolled_at: Utc::now(),
        source_image: image.to_string(),
        rectangle: Some(face.rectangle.into()),
        attributes: face.attributes,
    })
}

/// Re-detect from the retained source image once the fingerprint has aged
/// past its validity window; otherwise hand the model back unchanged.
pub async fn refresh_if_stale(
    client: &FaceApiClient,
    model: ReferenceModel,
    now: DateTime<Utc>,
) -> Result<ReferenceModel, EnrollError> {
    if !model.is_stale(now) {
        return Ok(model);
    }

    let age_hours = (now - model.enrolled_at).num_hours();
    tracing::info!(age_hours, source = %model.source_image, "fingerprint expired, re-detecting");
    enroll(client, &ImageRef::parse(&model.source_image)).await
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no reference model at {0} — run `facewatch enroll <image>` first")]
    NotFound(PathBuf),
    #[error("corrupt reference model: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("reference model has an empty fingerprint")]
    MissingFingerprint,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk store for the single reference model record.
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ReferenceModel, ModelError> {
        if !self.path.exists() {
            return Err(ModelError::NotFound(self.path.clone()));
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let model: ReferenceModel = serde_json::from_str(&raw)?;
        if !model.is_valid() {
            return Err(ModelError::MissingFingerprint);
        }
        Ok(model)
    }

    /// Write via temp file + rename so a crash cannot leave a torn record.
    pub fn save(&self, model: &ReferenceModel) -> Result<(), ModelError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(model)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "reference model saved");
        Ok(())
    }
}
