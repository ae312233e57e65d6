//! Recognition audit trail.

use crate::store::{with_timeout, GalleryStore, StoreError};
use crate::types::{MatchVerdict, RecognitionLogEntry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("recognition log write failed: {0}")]
pub struct AuditError(#[from] pub StoreError);

/// Appends one log entry per recognition attempt, matched or not.
pub struct RecognitionAuditor {
    store: Arc<dyn GalleryStore>,
    store_timeout: Duration,
}

impl RecognitionAuditor {
    pub fn new(store: Arc<dyn GalleryStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Record `verdict` for the image at `source_image`.
    ///
    /// A failure here never changes the verdict; callers report it alongside.
    pub async fn record_attempt(
        &self,
        verdict: &MatchVerdict,
        source_image: &str,
    ) -> Result<(), AuditError> {
        let entry = RecognitionLogEntry::from_verdict(verdict, source_image, Utc::now());
        with_timeout(self.store_timeout, self.store.append_recognition_log(&entry))
            .await
            .map_err(|e| {
                tracing::warn!(
                    error = %e,
                    source_image,
                    matched = verdict.matched,
                    "failed to record recognition attempt"
                );
                AuditError(e)
            })
    }
}
