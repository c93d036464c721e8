//! Remote face verification — detect-then-compare against a hosted face API.
//!
//! Two dependent calls per verification: a detect call that turns image
//! bytes into a short-lived face identifier, and a compare call that scores
//! that identifier against the enrolled fingerprint. An empty detect result
//! is a definite non-match and never spends the compare call.

use crate::model::ReferenceModel;
use crate::types::{DetectionBox, VerificationResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

const DETECT_PATH: &str = "/face/v1.0/detect";
const COMPARE_PATH: &str = "/face/v1.0/verify";
const API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
/// Attributes requested alongside detection; kept as enrollment metadata.
const DETECT_ATTRIBUTES: &str = "age,gender,glasses,hair";

#[derive(Error, Debug)]
pub enum FaceApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Image handed to the detect endpoint: either a URL the service fetches
/// itself, or raw bytes shipped in the request body.
pub enum DetectPayload {
    Url(String),
    Bytes(Vec<u8>),
}

/// One face in a detect response.
#[derive(Debug, Clone, Deserialize)]
pub struct FaceRecord {
    #[serde(rename = "faceId")]
    pub face_id: String,
    #[serde(rename = "faceRectangle")]
    pub rectangle: FaceRectangle,
    #[serde(rename = "faceAttributes", default)]
    pub attributes: Option<serde_json::Value>,
}

/// Wire shape of a face rectangle.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FaceRectangle {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl From<FaceRectangle> for DetectionBox {
    fn from(r: FaceRectangle) -> Self {
        DetectionBox {
            left: r.left,
            top: r.top,
            width: r.width,
            height: r.height,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(rename = "isIdentical", default)]
    #[allow(dead_code)]
    is_identical: bool,
    confidence: f32,
}

/// Scores a candidate frame against the enrolled identity.
#[allow(async_fn_in_trait)]
pub trait RemoteVerifier {
    /// Verify that `jpeg` shows the person enrolled in `model`.
    async fn verify(
        &self,
        model: &ReferenceModel,
        jpeg: &[u8],
    ) -> Result<VerificationResult, FaceApiError>;
}

/// HTTP client for the face API's detect and verify endpoints.
pub struct FaceApiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl FaceApiClient {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Detect faces in an image. An empty list means the service saw no
    /// face — a valid response, distinct from any error.
    pub async fn detect(&self, payload: DetectPayload) -> Result<Vec<FaceRecord>, FaceApiError> {
        let url = format!(
            "{}{}?returnFaceId=true&returnFaceAttributes={}",
            self.endpoint, DETECT_PATH, DETECT_ATTRIBUTES
        );

        let request = match payload {
            DetectPayload::Url(image_url) => self
                .http
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(CONTENT_TYPE, "application/json")
                .json(&serde_json::json!({ "url": image_url })),
            DetectPayload::Bytes(bytes) => self
                .http
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FaceApiError::Status { status, body });
        }

        let faces: Vec<FaceRecord> = response
            .json()
            .await
            .map_err(|e| FaceApiError::Malformed(e.to_string()))?;
        tracing::debug!(count = faces.len(), "detect complete");
        Ok(faces)
    }

    /// Compare two face identifiers, returning the service confidence.
    pub async fn compare(&self, probe_id: &str, reference_id: &str) -> Result<f32, FaceApiError> {
        let url = format!("{}{}", self.endpoint, COMPARE_PATH);

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({
                "faceId1": probe_id,
                "faceId2": reference_id,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FaceApiError::Status { status, body });
        }

        let parsed: CompareResponse = response
            .json()
            .await
            .map_err(|e| FaceApiError::Malformed(e.to_string()))?;
        Ok(parsed.confidence)
    }
}

impl RemoteVerifier for FaceApiClient {
    async fn verify(
        &self,
        model: &ReferenceModel,
        jpeg: &[u8],
    ) -> Result<VerificationResult, FaceApiError> {
        let faces = self.detect(DetectPayload::Bytes(jpeg.to_vec())).await?;

        // First face in response order is the candidate; no face means the
        // compare call would be a guaranteed non-match, so skip it.
        let Some(face) = faces.into_iter().next() else {
            return Ok(VerificationResult::no_match());
        };

        let confidence = self.compare(&face.face_id, &model.fingerprint).await?;
        tracing::debug!(confidence, "compare complete");

        Ok(VerificationResult {
            confidence,
            matched_box: Some(face.rectangle.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detect_response() {
        let body = r#"[
            {
                "faceId": "c5c24a82-6845-4031-9d5d-978df9175426",
                "faceRectangle": {"left": 230, "top": 120, "width": 95, "height": 95},
                "faceAttributes": {"age": 31.0, "glasses": "NoGlasses"}
            },
            {
                "faceId": "65d083d4-9447-47d1-af30-b626144bf0fb",
                "faceRectangle": {"left": 60, "top": 80, "width": 92, "height": 92}
            }
        ]"#;
        let faces: Vec<FaceRecord> = serde_json::from_str(body).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].face_id, "c5c24a82-6845-4031-9d5d-978df9175426");
        assert_eq!(faces[0].rectangle.left, 230.0);
        assert!(faces[0].attributes.is_some());
        assert!(faces[1].attributes.is_none());
    }

    #[test]
    fn test_parse_empty_detect_response() {
        let faces: Vec<FaceRecord> = serde_json::from_str("[]").unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_parse_compare_response() {
        let body = r#"{"isIdentical": true, "confidence": 0.83}"#;
        let parsed: CompareResponse = serde_json::from_str(body).unwrap();
        assert!((parsed.confidence - 0.83).abs() < 1e-6);
    }

    #[test]
    fn test_parse_compare_response_without_identical_flag() {
        let parsed: CompareResponse = serde_json::from_str(r#"{"confidence": 0.1}"#).unwrap();
        assert!((parsed.confidence - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_rectangle_to_detection_box() {
        let b: DetectionBox = FaceRectangle {
            left: 1.0,
            top: 2.0,
            width: 3.0,
            height: 4.0,
        }
        .into();
        assert_eq!(b.left, 1.0);
        assert_eq!(b.height, 4.0);
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = FaceApiClient::new("https://example.invalid/", "key");
        assert_eq!(client.endpoint, "https://example.invalid");
    }
}
