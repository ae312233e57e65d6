//! In-memory fakes shared by the unit tests of this crate.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::{GalleryStore, StoreError};
use crate::types::{
    BoundingBox, DetectedFace, Embedding, FaceEmbedding, GalleryEntry, Identity, IdentityFields,
    IdentityId, IdentityPatch, RecognitionLogEntry, RecognitionLogRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    next_identity: IdentityId,
    next_embedding: i64,
    next_log: i64,
    identities: BTreeMap<IdentityId, Identity>,
    embeddings: Vec<FaceEmbedding>,
    logs: Vec<RecognitionLogRecord>,
}

/// Gallery store backed by plain collections, with switchable failures.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub writes: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub stall_reads: AtomicBool,
    pub fail_embedding_writes: AtomicBool,
    pub fail_log_writes: AtomicBool,
    /// Milliseconds `update_identity` waits before applying the patch.
    pub update_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn log_count(&self) -> usize {
        self.state.lock().unwrap().logs.len()
    }

    pub fn logs(&self) -> Vec<RecognitionLogRecord> {
        self.state.lock().unwrap().logs.clone()
    }

    pub fn identity_count(&self) -> usize {
        self.state.lock().unwrap().identities.len()
    }

    /// Seed an identity with one embedding, bypassing the write counter.
    pub fn seed(&self, name: &str, values: Vec<f32>) -> IdentityId {
        let mut state = self.state.lock().unwrap();
        state.next_identity += 1;
        state.next_embedding += 1;
        let id = state.next_identity;
        let embedding_id = state.next_embedding;
        state.identities.insert(id, identity(id, &IdentityFields::named(name)));
        state.embeddings.push(FaceEmbedding {
            id: embedding_id,
            identity_id: id,
            embedding: Embedding::new(values),
            source_image: None,
        });
        id
    }

    fn unavailable_if(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

fn identity(id: IdentityId, fields: &IdentityFields) -> Identity {
    let now = Utc::now();
    Identity {
        id,
        name: fields.name.clone(),
        age: fields.age,
        gender: fields.gender.clone(),
        phone: fields.phone.clone(),
        email: fields.email.clone(),
        address: fields.address.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl GalleryStore for MemoryStore {
    async fn create_identity(&self, fields: &IdentityFields) -> Result<Identity, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.next_identity += 1;
        let created = identity(state.next_identity, fields);
        state.identities.insert(created.id, created.clone());
        Ok(created)
    }

    async fn create_embedding(
        &self,
        identity_id: IdentityId,
        embedding: &Embedding,
        source_image: Option<&str>,
    ) -> Result<FaceEmbedding, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Self::unavailable_if(&self.fail_embedding_writes)?;
        let mut state = self.state.lock().unwrap();
        if !state.identities.contains_key(&identity_id) {
            return Err(StoreError::NotFound(identity_id));
        }
        state.next_embedding += 1;
        let stored = FaceEmbedding {
            id: state.next_embedding,
            identity_id,
            embedding: embedding.clone(),
            source_image: source_image.map(str::to_string),
        };
        state.embeddings.push(stored.clone());
        Ok(stored)
    }

    async fn read_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Self::unavailable_if(&self.fail_reads)?;
        let state = self.state.lock().unwrap();
        let mut entries: Vec<GalleryEntry> = state
            .embeddings
            .iter()
            .filter_map(|e| {
                state.identities.get(&e.identity_id).map(|i| GalleryEntry {
                    identity: i.clone(),
                    embedding: e.clone(),
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.identity.id, e.embedding.id));
        Ok(entries)
    }

    async fn read_identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        Self::unavailable_if(&self.fail_reads)?;
        Ok(self.state.lock().unwrap().identities.get(&id).cloned())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Self::unavailable_if(&self.fail_reads)?;
        Ok(self.state.lock().unwrap().identities.values().cloned().collect())
    }

    async fn update_identity(
        &self,
        id: IdentityId,
        patch: &IdentityPatch,
    ) -> Result<Identity, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let delay = self.update_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut state = self.state.lock().unwrap();
        let current = state.identities.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(name) = &patch.name {
            current.name = name.clone();
        }
        if let Some(age) = patch.age {
            current.age = Some(age);
        }
        if let Some(phone) = &patch.phone {
            current.phone = Some(phone.clone());
        }
        current.updated_at = Utc::now();
        Ok(current.clone())
    }

    async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.identities.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        state.embeddings.retain(|e| e.identity_id != id);
        for log in state.logs.iter_mut().filter(|l| l.entry.identity_id == Some(id)) {
            log.entry.identity_id = None;
        }
        Ok(())
    }

    async fn append_recognition_log(&self, entry: &RecognitionLogEntry) -> Result<(), StoreError> {
        Self::unavailable_if(&self.fail_log_writes)?;
        let mut state = self.state.lock().unwrap();
        state.next_log += 1;
        let record = RecognitionLogRecord {
            id: state.next_log,
            entry: entry.clone(),
            name: None,
            age: None,
            gender: None,
        };
        state.logs.push(record);
        Ok(())
    }

    async fn read_recognition_logs(
        &self,
        limit: u32,
    ) -> Result<Vec<RecognitionLogRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.iter().rev().take(limit as usize).cloned().collect())
    }
}

/// Provider returning a fixed list of faces for every image.
pub struct FixedProvider {
    pub faces: Vec<DetectedFace>,
}

impl FixedProvider {
    pub fn with_embeddings(embeddings: &[Vec<f32>]) -> Self {
        let faces = embeddings
            .iter()
            .enumerate()
            .map(|(i, values)| DetectedFace {
                bounding_box: BoundingBox {
                    top: 10,
                    right: 60 + 100 * i as u32,
                    bottom: 60,
                    left: 10 + 100 * i as u32,
                },
                embedding: Embedding::new(values.clone()),
            })
            .collect();
        Self { faces }
    }
}

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    async fn detect(&self, _image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
        Ok(self.faces.clone())
    }
}
