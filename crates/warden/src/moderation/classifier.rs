//! Image classification and OCR collaborator.
//!
//! The pipeline only depends on the [`ImageAnalyzer`] trait; the HTTP client
//! below talks to an Azure-style vision endpoint. Every failure here is
//! best-effort territory for the caller: a broken analyzer means "that
//! sub-check found nothing", never a blocked pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gatehouse_common::WardenError;

/// One tag the classifier assigned to an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTag {
    pub name: String,
    pub confidence: f32,
}

#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn classify_image(&self, image: &[u8]) -> Result<Vec<ImageTag>, WardenError>;
    async fn extract_text(&self, image: &[u8]) -> Result<String, WardenError>;
}

/// Analyzer used when no vision service is configured. Finds nothing, so the
/// caption denylist remains the only active sub-check.
pub struct DisabledAnalyzer;

#[async_trait]
impl ImageAnalyzer for DisabledAnalyzer {
    async fn classify_image(&self, _image: &[u8]) -> Result<Vec<ImageTag>, WardenError> {
        Ok(Vec::new())
    }

    async fn extract_text(&self, _image: &[u8]) -> Result<String, WardenError> {
        Ok(String::new())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdultScores {
    #[serde(default)]
    is_adult_content: bool,
    #[serde(default)]
    adult_score: f32,
    #[serde(default)]
    is_racy_content: bool,
    #[serde(default)]
    racy_score: f32,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    tags: Vec<ImageTag>,
    #[serde(default)]
    adult: Option<AdultScores>,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
}

/// HTTP client for the vision service.
pub struct VisionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl VisionClient {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post_image<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        image: &[u8],
    ) -> Result<T, WardenError> {
        let url = format!("{}/{path}", self.endpoint);
        let response = self
            .http
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| WardenError::Classifier(format!("{path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::Classifier(format!("{path}: {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| WardenError::Classifier(format!("{path}: bad response: {e}")))
    }
}

#[async_trait]
impl ImageAnalyzer for VisionClient {
    async fn classify_image(&self, image: &[u8]) -> Result<Vec<ImageTag>, WardenError> {
        let reply: AnalyzeResponse = self.post_image("analyze", image).await?;
        let mut tags = reply.tags;

        // Adult-content scores surface through the same tag mechanism the
        // denylist already checks.
        if let Some(adult) = reply.adult {
            if adult.is_adult_content {
                tags.push(ImageTag {
                    name: "adult content".to_string(),
                    confidence: adult.adult_score,
                });
            }
            if adult.is_racy_content {
                tags.push(ImageTag {
                    name: "nsfw".to_string(),
                    confidence: adult.racy_score,
                });
            }
        }
        Ok(tags)
    }

    async fn extract_text(&self, image: &[u8]) -> Result<String, WardenError> {
        let reply: OcrResponse = self.post_image("ocr", image).await?;
        Ok(reply.text)
    }
}
