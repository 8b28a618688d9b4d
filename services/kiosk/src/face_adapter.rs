use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiosk_core::embedding::Embedding;
use kiosk_core::perception::FaceDetector;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct EncodingsResponse {
    encodings: Vec<Vec<f64>>,
}

/// Face detection delegated to an HTTP sidecar that wraps the encoding model.
///
/// The sidecar takes the raw image bytes and answers with one 128-d encoding
/// per detected face.
pub struct HttpFaceDetector {
    client: Client,
    base_url: String,
}

impl HttpFaceDetector {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build face service HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Embedding>> {
        let resp = self
            .client
            .post(format!("{}/encodings", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .context("Face service request failed")?
            .error_for_status()
            .context("Face service returned an error status")?
            .json::<EncodingsResponse>()
            .await
            .context("Failed to decode face service response")?;

        tracing::trace!("Face service found {} faces", resp.encodings.len());
        Ok(resp.encodings.into_iter().map(Embedding::from).collect())
    }
}
