//! In-memory face gallery, synchronized from the durable store.
//!
//! The current [`GallerySnapshot`] is held behind an [`ArcSwap`]: readers take
//! an `Arc` to a frozen snapshot and never block, while [`FaceGallery::reload`]
//! builds a complete replacement and swaps the reference in one step.

use crate::store::{with_timeout, GalleryStore, StoreError};
use crate::types::{GalleryEntry, Identity, IdentityId};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Immutable, ordered view of every enrolled (identity, embedding) pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
}

impl GallerySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from store rows, keeping their order.
    ///
    /// Rows whose embedding does not belong to the paired identity are dropped.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        let total = entries.len();
        let entries: Vec<GalleryEntry> =
            entries.into_iter().filter(|e| e.is_consistent()).collect();
        if entries.len() != total {
            tracing::warn!(
                dropped = total - entries.len(),
                "gallery rows with mismatched identity references dropped"
            );
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity(&self, id: IdentityId) -> Option<&Identity> {
        self.entries
            .iter()
            .find(|e| e.identity.id == id)
            .map(|e| &e.identity)
    }

    /// Distinct identities in snapshot order.
    pub fn identities(&self) -> Vec<&Identity> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.identity.id))
            .map(|e| &e.identity)
            .collect()
    }
}

/// Owner of the live gallery snapshot.
pub struct FaceGallery {
    store: Arc<dyn GalleryStore>,
    snapshot: ArcSwap<GallerySnapshot>,
    /// Serializes reloads so an older fetch can never replace a newer one.
    reload_lock: Mutex<()>,
    store_timeout: Duration,
}

impl FaceGallery {
    /// Create a gallery with an empty snapshot. Call [`reload`](Self::reload) to populate it.
    pub fn new(store: Arc<dyn GalleryStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(GallerySnapshot::empty()),
            reload_lock: Mutex::new(()),
            store_timeout,
        }
    }

    /// Create a gallery and perform the initial load, failing fast if the store is down.
    pub async fn load(
        store: Arc<dyn GalleryStore>,
        store_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let gallery = Self::new(store, store_timeout);
        gallery.reload().await?;
        Ok(gallery)
    }

    /// Replace the snapshot with the store's current contents.
    ///
    /// On failure the previous snapshot stays in place untouched.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let _guard = self.reload_lock.lock().await;
        let started = Instant::now();

        let rows = match with_timeout(self.store_timeout, self.store.read_all_embeddings()).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retained = self.snapshot.load().len(),
                    "gallery reload failed; keeping previous snapshot"
                );
                return Err(e);
            }
        };

        let snapshot = GallerySnapshot::from_entries(rows);
        let count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));

        tracing::info!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gallery reloaded"
        );
        Ok(count)
    }

    /// The live snapshot. Never blocks and never observes a reload in progress.
    pub fn current_snapshot(&self) -> Arc<GallerySnapshot> {
        self.snapshot.load_full()
    }
}
