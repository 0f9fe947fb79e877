//! Face and moderation-label detection used by content-aware edits.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::error::ImageHandlerError;

/// Face bounding box as ratios (0-1) of the image size
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationLabel {
    pub name: String,
    pub confidence: f32,
    #[serde(default)]
    pub parent_name: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("detection service timed out after {0}ms")]
    Timeout(u64),

    #[error("detection service request failed: {0}")]
    Transport(String),

    #[error("detection service returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("content-aware edits need a detection service")]
    NotConfigured,
}

impl From<DetectionError> for ImageHandlerError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::Timeout(_) => {
                ImageHandlerError::new(504, "DetectionTimeout", err.to_string())
            }
            DetectionError::NotConfigured => {
                ImageHandlerError::bad_request("DetectionUnavailable", err.to_string())
            }
            _ => ImageHandlerError::internal(err.to_string()),
        }
    }
}

#[async_trait]
pub trait DetectionService: Send + Sync {
    /// Detect faces in a PNG-encoded image
    async fn detect_faces(&self, image: Bytes) -> Result<Vec<BoundingBox>, DetectionError>;

    /// Detect moderation labels at or above `min_confidence` (0-100)
    async fn detect_moderation_labels(
        &self,
        image: Bytes,
        min_confidence: f32,
    ) -> Result<Vec<ModerationLabel>, DetectionError>;
}

#[derive(Deserialize)]
struct FacesResponse {
    faces: Vec<BoundingBox>,
}

#[derive(Deserialize)]
struct LabelsResponse {
    labels: Vec<ModerationLabel>,
}

/// Detection service reached over HTTP.
///
/// `POST {endpoint}/faces` and `POST {endpoint}/moderation-labels` take the
/// raw PNG as the body and answer with JSON.
pub struct HttpDetectionService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpDetectionService {
    pub fn new(config: &DetectionConfig) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DetectionError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
        image: Bytes,
    ) -> Result<T, DetectionError> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, path))
            .query(query)
            .header("content-type", "image/png")
            .body(image)
            .send()
            .await
            .map_err(|e| DetectionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DetectionError::Transport(format!(
                "status {}",
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DetectionError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl DetectionService for HttpDetectionService {
    async fn detect_faces(&self, image: Bytes) -> Result<Vec<BoundingBox>, DetectionError> {
        let response: FacesResponse = self.post("faces", &[], image).await?;
        Ok(response.faces)
    }

    async fn detect_moderation_labels(
        &self,
        image: Bytes,
        min_confidence: f32,
    ) -> Result<Vec<ModerationLabel>, DetectionError> {
        let response: LabelsResponse = self
            .post(
                "moderation-labels",
                &[("minConfidence", min_confidence.to_string())],
                image,
            )
            .await?;
        Ok(response.labels)
    }
}
