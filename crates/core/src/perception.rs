use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::embedding::Embedding;

/// Extracts face encodings from one encoded camera frame.
///
/// An empty vector means no face was found. When several faces are present
/// the session only looks at the first one.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Embedding>>;
}
