//! Recognition path: detect, match against one snapshot, audit.

use crate::audit::RecognitionAuditor;
use crate::gallery::FaceGallery;
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{Identity, MatchVerdict};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Verdict for one detected face, with the matched identity's fields joined in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recognition {
    #[serde(flatten)]
    pub verdict: MatchVerdict,
    pub identity: Option<Identity>,
}

/// Result of one recognition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReport {
    pub source_image: String,
    /// One entry per detected face, in provider order.
    pub results: Vec<Recognition>,
    /// Audit-log failures. They never invalidate `results`.
    pub audit_warnings: Vec<String>,
}

impl RecognitionReport {
    pub fn matched_count(&self) -> usize {
        self.results.iter().filter(|r| r.verdict.matched).count()
    }
}

pub struct Recognizer {
    provider: Arc<dyn EmbeddingProvider>,
    gallery: Arc<FaceGallery>,
    auditor: RecognitionAuditor,
    tolerance: f32,
}

impl Recognizer {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        gallery: Arc<FaceGallery>,
        auditor: RecognitionAuditor,
        tolerance: f32,
    ) -> Self {
        Self {
            provider,
            gallery,
            auditor,
            tolerance,
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Identify every face in `image` against the current gallery.
    ///
    /// Each face verdict is audited. An image with no faces still records one
    /// unmatched attempt, so every call leaves an audit entry.
    pub async fn recognize(&self, image: &Path) -> Result<RecognitionReport, RecognitionError> {
        let source_image = image.to_string_lossy().into_owned();
        let faces = self.provider.detect(image).await?;
        let snapshot = self.gallery.current_snapshot();
        let matcher = EuclideanMatcher;

        let mut results = Vec::with_capacity(faces.len());
        let mut audit_warnings = Vec::new();

        if faces.is_empty() {
            let verdict = MatchVerdict::unmatched(None);
            if let Err(e) = self.auditor.record_attempt(&verdict, &source_image).await {
                audit_warnings.push(e.to_string());
            }
        }

        for face in faces {
            let verdict = matcher
                .compare(&face.embedding, &snapshot, self.tolerance)
                .with_bounding_box(face.bounding_box);
            tracing::debug!(
                matched = verdict.matched,
                identity_id = ?verdict.identity_id,
                distance = ?verdict.distance,
                "face compared"
            );
            if let Err(e) = self.auditor.record_attempt(&verdict, &source_image).await {
                audit_warnings.push(e.to_string());
            }
            let identity = verdict
                .identity_id
                .and_then(|id| snapshot.identity(id))
                .cloned();
            results.push(Recognition { verdict, identity });
        }

        let report = RecognitionReport {
            source_image,
            results,
            audit_warnings,
        };
        tracing::info!(
            image = %report.source_image,
            faces = report.results.len(),
            matched = report.matched_count(),
            gallery = snapshot.len(),
            audit_failures = report.audit_warnings.len(),
            "recognition complete"
        );
        Ok(report)
    }
}
