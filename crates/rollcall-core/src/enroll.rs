//! Enrollment and roster maintenance.
//!
//! Every successful write is followed by a gallery reload. A reload failure
//! after a durable write is logged, not returned: the data is stored and the
//! gallery catches up on the next reload.

use crate::gallery::FaceGallery;
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::{with_timeout, GalleryStore, StoreError};
use crate::types::{Identity, IdentityFields, IdentityId, IdentityPatch};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("image contains {0} faces; enrollment needs a photo with exactly one")]
    MultipleFacesDetected(usize),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("gallery store unavailable: {0}")]
    StoreUnavailable(StoreError),
    /// The identity row exists but has no embedding. The caller decides
    /// whether to retry or remove it.
    #[error("identity {identity_id} was stored but its face embedding was not: {source}")]
    PartialEnrollmentFailure {
        identity_id: IdentityId,
        source: StoreError,
    },
}

impl From<StoreError> for EnrollmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EnrollmentError::UnknownIdentity(id),
            other => EnrollmentError::StoreUnavailable(other),
        }
    }
}

impl EnrollmentError {
    /// Errors the caller can fix by changing the request.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EnrollmentError::NoFaceDetected
                | EnrollmentError::MultipleFacesDetected(_)
                | EnrollmentError::InvalidIdentity(_)
                | EnrollmentError::UnknownIdentity(_)
        )
    }
}

/// Per-identity write locks. Writes for different identities run concurrently.
///
/// An entry lives only while some writer holds or waits on it.
#[derive(Default)]
struct IdentityLocks {
    locks: std::sync::Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    async fn acquire(&self, id: IdentityId) -> IdentityGuard<'_> {
        let lock = self.table().entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        IdentityGuard {
            id,
            owner: self,
            guard: Some(guard),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<IdentityId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

/// Exclusive write access to one identity.
struct IdentityGuard<'a> {
    id: IdentityId,
    owner: &'a IdentityLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.owner.table();
        // Only the table's own reference left: no writer holds or waits on it.
        if table.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.id);
        }
    }
}

pub struct EnrollmentCoordinator {
    store: Arc<dyn GalleryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    gallery: Arc<FaceGallery>,
    store_timeout: Duration,
    locks: IdentityLocks,
}

impl EnrollmentCoordinator {
    pub fn new(
        store: Arc<dyn GalleryStore>,
        provider: Arc<dyn EmbeddingProvider>,
        gallery: Arc<FaceGallery>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            gallery,
            store_timeout,
            locks: IdentityLocks::default(),
        }
    }

    /// Register a new person from a photo containing exactly one face.
    pub async fn enroll(
        &self,
        image: &Path,
        fields: IdentityFields,
    ) -> Result<Identity, EnrollmentError> {
        let source_image = image.to_string_lossy().into_owned();

        let mut faces = self.provider.detect(image).await?;
        let face = match faces.len() {
            0 => return Err(EnrollmentError::NoFaceDetected),
            1 => faces.remove(0),
            n => return Err(EnrollmentError::MultipleFacesDetected(n)),
        };
        let fields = normalize_fields(fields)?;

        let identity =
            with_timeout(self.store_timeout, self.store.create_identity(&fields)).await?;

        {
            let _guard = self.locks.acquire(identity.id).await;
            let stored = with_timeout(
                self.store_timeout,
                self.store
                    .create_embedding(identity.id, &face.embedding, Some(&source_image)),
            )
            .await;
            if let Err(source) = stored {
                tracing::warn!(
                    identity_id = identity.id,
                    error = %source,
                    "identity stored without embedding"
                );
                return Err(EnrollmentError::PartialEnrollmentFailure {
                    identity_id: identity.id,
                    source,
                });
            }
        }

        tracing::info!(
            identity_id = identity.id,
            name = %identity.name,
            dim = face.embedding.dim(),
            "identity enrolled"
        );
        self.refresh_gallery("enroll").await;
        Ok(identity)
    }

    /// Apply a partial update to an enrolled identity.
    pub async fn update_identity(
        &self,
        id: IdentityId,
        patch: IdentityPatch,
    ) -> Result<Identity, EnrollmentError> {
        let patch = normalize_patch(patch)?;
        let identity = {
            let _guard = self.locks.acquire(id).await;
            with_timeout(self.store_timeout, self.store.update_identity(id, &patch)).await?
        };
        tracing::info!(identity_id = id, "identity updated");
        self.refresh_gallery("update").await;
        Ok(identity)
    }

    /// Delete an identity together with its embeddings.
    pub async fn remove_identity(&self, id: IdentityId) -> Result<(), EnrollmentError> {
        {
            let _guard = self.locks.acquire(id).await;
            with_timeout(self.store_timeout, self.store.delete_identity(id)).await?;
        }
        tracing::info!(identity_id = id, "identity removed");
        self.refresh_gallery("remove").await;
        Ok(())
    }

    async fn refresh_gallery(&self, reason: &str) {
        if let Err(e) = self.gallery.reload().await {
            tracing::warn!(
                error = %e,
                reason,
                "gallery reload after write failed; serving previous snapshot"
            );
        }
    }
}

fn normalize_fields(mut fields: IdentityFields) -> Result<IdentityFields, EnrollmentError> {
    let name = fields.name.trim();
    if name.is_empty() {
        return Err(EnrollmentError::InvalidIdentity("name must not be empty".into()));
    }
    fields.name = name.to_string();
    Ok(fields)
}

fn normalize_patch(mut patch: IdentityPatch) -> Result<IdentityPatch, EnrollmentError> {
    if let Some(name) = patch.name.as_deref() {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollmentError::InvalidIdentity("name must not be empty".into()));
        }
        patch.name = Some(name.to_string());
    }
    Ok(patch)
}
