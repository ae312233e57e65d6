//! Durable gallery store contract.
//!
//! The engine only needs row-level atomic operations; it never assumes
//! multi-statement transactions. Every call made by the engine goes through
//! [`with_timeout`] so a hung backend surfaces as [`StoreError::Unavailable`].

use crate::types::{
    Embedding, FaceEmbedding, GalleryEntry, Identity, IdentityFields, IdentityId, IdentityPatch,
    RecognitionLogEntry, RecognitionLogRecord,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached, was busy, or did not answer in time.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Transient failures a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait GalleryStore: Send + Sync {
    /// Insert a new identity; the store assigns its id and timestamps.
    async fn create_identity(&self, fields: &IdentityFields) -> Result<Identity, StoreError>;

    /// Attach an embedding to an existing identity.
    async fn create_embedding(
        &self,
        identity_id: IdentityId,
        embedding: &Embedding,
        source_image: Option<&str>,
    ) -> Result<FaceEmbedding, StoreError>;

    /// All (identity, embedding) pairs, ordered by identity id then embedding id.
    /// Rows that cannot be decoded are skipped, not reported as an error.
    async fn read_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    async fn read_identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError>;

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Apply a partial update. Fails with [`StoreError::NotFound`] for unknown ids.
    async fn update_identity(
        &self,
        id: IdentityId,
        patch: &IdentityPatch,
    ) -> Result<Identity, StoreError>;

    /// Delete an identity, its embeddings, and null out its log references.
    async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError>;

    async fn append_recognition_log(&self, entry: &RecognitionLogEntry) -> Result<(), StoreError>;

    /// Most recent log entries first.
    async fn read_recognition_logs(
        &self,
        limit: u32,
    ) -> Result<Vec<RecognitionLogRecord>, StoreError>;
}

/// Run a store future under `limit`, classifying an elapsed deadline as unavailable.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_through_result() {
        let ok = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(5) }).await;
        assert_eq!(ok.unwrap(), 5);

        let err = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(StoreError::NotFound(3))
        })
        .await;
        assert!(matches!(err, Err(StoreError::NotFound(3))));
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed_is_unavailable() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient(), "got {err}");
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound(1).is_transient());
        assert!(!StoreError::Corrupt("bad blob".into()).is_transient());
    }
}
