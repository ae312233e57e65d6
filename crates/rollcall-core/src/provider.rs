//! Embedding provider contract.
//!
//! Detection and embedding extraction are delegated to an external
//! capability; the engine only consumes its output.

use crate::types::DetectedFace;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("face extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("extractor returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Given an image, produce zero or more (bounding box, embedding) pairs.
///
/// Implementations must be deterministic for identical input and configuration.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn detect(&self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError>;
}
