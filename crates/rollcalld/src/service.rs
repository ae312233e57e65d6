use crate::config::Config;
use anyhow::{Context, Result};
use rollcall_core::store::with_timeout;
use rollcall_core::{
    EmbeddingProvider, EnrollmentCoordinator, EnrollmentError, FaceGallery, GalleryStore, Identity,
    IdentityFields, IdentityId, IdentityPatch, RecognitionAuditor, RecognitionError,
    RecognitionLogRecord, RecognitionReport, Recognizer, StoreError,
};
use rollcall_extract::CommandExtractor;
use rollcall_store::SqliteStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Largest page of recognition logs returned in one call.
pub const MAX_LOG_PAGE: u32 = 1_000;

/// Everything the daemon serves, wired over one store and one gallery.
pub struct Services {
    store: Arc<dyn GalleryStore>,
    gallery: Arc<FaceGallery>,
    recognizer: Recognizer,
    coordinator: EnrollmentCoordinator,
    store_timeout: Duration,
}

impl Services {
    /// Open the database, configure the extractor, and load the gallery.
    ///
    /// Fails fast: the daemon never serves an unloaded gallery.
    pub async fn start(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening gallery database {}", config.db_path.display()))?
            .with_write_budget(write_budget(config.store_timeout()));

        let extractor = CommandExtractor::new(config.extractor_config())?;

        let services = Self::assemble(
            Arc::new(store),
            Arc::new(extractor),
            config.tolerance,
            config.store_timeout(),
        )
        .await
        .context("loading face gallery")?;
        Ok(services)
    }

    pub async fn assemble(
        store: Arc<dyn GalleryStore>,
        provider: Arc<dyn EmbeddingProvider>,
        tolerance: f32,
        store_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let gallery = Arc::new(FaceGallery::load(Arc::clone(&store), store_timeout).await?);
        tracing::info!(
            entries = gallery.current_snapshot().len(),
            tolerance,
            "face gallery loaded"
        );

        let auditor = RecognitionAuditor::new(Arc::clone(&store), store_timeout);
        let recognizer = Recognizer::new(
            Arc::clone(&provider),
            Arc::clone(&gallery),
            auditor,
            tolerance,
        );
        let coordinator = EnrollmentCoordinator::new(
            Arc::clone(&store),
            provider,
            Arc::clone(&gallery),
            store_timeout,
        );

        Ok(Self {
            store,
            gallery,
            recognizer,
            coordinator,
            store_timeout,
        })
    }

    pub async fn recognize(&self, image: &Path) -> Result<RecognitionReport, RecognitionError> {
        self.recognizer.recognize(image).await
    }

    pub async fn enroll(
        &self,
        image: &Path,
        fields: IdentityFields,
    ) -> Result<Identity, EnrollmentError> {
        self.coordinator.enroll(image, fields).await
    }

    pub async fn update_identity(
        &self,
        id: IdentityId,
        patch: IdentityPatch,
    ) -> Result<Identity, EnrollmentError> {
        self.coordinator.update_identity(id, patch).await
    }

    pub async fn remove_identity(&self, id: IdentityId) -> Result<(), EnrollmentError> {
        self.coordinator.remove_identity(id).await
    }

    /// Every identity in the store, including ones without an embedding.
    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        with_timeout(self.store_timeout, self.store.list_identities()).await
    }

    /// Most recent recognition attempts first; `limit` is capped at [`MAX_LOG_PAGE`].
    pub async fn recognition_logs(
        &self,
        limit: u32,
    ) -> Result<Vec<RecognitionLogRecord>, StoreError> {
        let limit = limit.min(MAX_LOG_PAGE);
        with_timeout(self.store_timeout, self.store.read_recognition_logs(limit)).await
    }

    /// Force a gallery reload; returns the new entry count.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        self.gallery.reload().await
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.current_snapshot().len()
    }

    pub fn enrolled_identities(&self) -> usize {
        self.gallery.current_snapshot().identities().len()
    }

    pub fn tolerance(&self) -> f32 {
        self.recognizer.tolerance()
    }
}

/// SQLite write budget: short of the store timeout, so a write the caller
/// abandoned has already failed rather than committing later.
fn write_budget(store_timeout: Duration) -> Duration {
    store_timeout * 4 / 5
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rollcall_core::{BoundingBox, DetectedFace, Embedding, ProviderError};
    use std::collections::HashMap;

    /// Returns canned faces keyed by image file name.
    struct ScriptedProvider {
        faces: HashMap<String, Vec<Vec<f32>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<(&str, Vec<Vec<f32>>)>) -> Self {
            let faces = script
                .into_iter()
                .map(|(name, faces)| (name.to_string(), faces))
                .collect();
            Self { faces }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn detect(&self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
            let name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let faces = self
                .faces
                .get(&name)
                .ok_or_else(|| ProviderError::ImageNotFound(name.clone()))?;
            Ok(faces
                .iter()
                .enumerate()
                .map(|(i, values)| DetectedFace {
                    bounding_box: BoundingBox {
                        top: 10,
                        right: 60 + i as u32 * 100,
                        bottom: 60,
                        left: 10 + i as u32 * 100,
                    },
                    embedding: Embedding::new(values.clone()),
                })
                .collect())
        }
    }

    async fn services(provider: ScriptedProvider) -> Services {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Services::assemble(
            Arc::new(store),
            Arc::new(provider),
            0.6,
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enroll_then_recognize_group_photo() {
        let svc = services(ScriptedProvider::new(vec![
            ("alice.jpg", vec![vec![0.0, 0.0]]),
            ("bob.jpg", vec![vec![1.0, 1.0]]),
            ("group.jpg", vec![vec![0.1, 0.0], vec![5.0, 5.0]]),
        ]))
        .await;
        assert_eq!(svc.gallery_size(), 0);

        let alice = svc
            .enroll(Path::new("/photos/alice.jpg"), IdentityFields::named("Alice"))
            .await
            .unwrap();
        svc.enroll(Path::new("/photos/bob.jpg"), IdentityFields::named("Bob"))
            .await
            .unwrap();
        assert_eq!(svc.gallery_size(), 2);
        assert_eq!(svc.enrolled_identities(), 2);

        let report = svc.recognize(Path::new("/photos/group.jpg")).await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.matched_count(), 1);
        assert_eq!(report.results[0].verdict.identity_id, Some(alice.id));
        assert_eq!(report.results[0].identity.as_ref().unwrap().name, "Alice");
        assert!(!report.results[1].verdict.matched);
        assert!(report.audit_warnings.is_empty());

        let logs = svc.recognition_logs(50).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.entry.source_image == "/photos/group.jpg"));
    }

    #[tokio::test]
    async fn test_group_photo_enrollment_rejected() {
        let svc =
            services(ScriptedProvider::new(vec![("group.jpg", vec![vec![0.0], vec![1.0]])])).await;
        let err = svc
            .enroll(Path::new("group.jpg"), IdentityFields::named("Crowd"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::MultipleFacesDetected(2)));
        assert!(svc.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_identity_no_longer_matches() {
        let svc = services(ScriptedProvider::new(vec![
            ("alice.jpg", vec![vec![0.0, 0.0]]),
            ("probe.jpg", vec![vec![0.05, 0.0]]),
        ]))
        .await;
        let alice = svc
            .enroll(Path::new("alice.jpg"), IdentityFields::named("Alice"))
            .await
            .unwrap();
        assert!(svc.recognize(Path::new("probe.jpg")).await.unwrap().results[0].verdict.matched);

        svc.remove_identity(alice.id).await.unwrap();
        assert_eq!(svc.gallery_size(), 0);
        let report = svc.recognize(Path::new("probe.jpg")).await.unwrap();
        assert!(!report.results[0].verdict.matched);

        // Past log rows survive the identity with the link cleared.
        let logs = svc.recognition_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.entry.identity_id.is_none()));
    }

    #[tokio::test]
    async fn test_update_identity_visible_after_reload() {
        let svc = services(ScriptedProvider::new(vec![
            ("alice.jpg", vec![vec![0.0]]),
            ("probe.jpg", vec![vec![0.0]]),
        ]))
        .await;
        let alice = svc
            .enroll(Path::new("alice.jpg"), IdentityFields::named("Alice"))
            .await
            .unwrap();
        let patch = IdentityPatch {
            phone: Some("555-0100".into()),
            ..Default::default()
        };
        let updated = svc.update_identity(alice.id, patch).await.unwrap();
        assert_eq!(updated.phone.as_deref(), Some("555-0100"));

        let report = svc.recognize(Path::new("probe.jpg")).await.unwrap();
        let identity = report.results[0].identity.as_ref().unwrap();
        assert_eq!(identity.phone.as_deref(), Some("555-0100"));
    }

    #[tokio::test]
    async fn test_unknown_identity_update() {
        let svc = services(ScriptedProvider::new(vec![])).await;
        let err = svc
            .update_identity(99, IdentityPatch { name: Some("X".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::UnknownIdentity(99)));
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_missing_image_is_provider_error() {
        let svc = services(ScriptedProvider::new(vec![])).await;
        let err = svc.recognize(Path::new("nope.jpg")).await.unwrap_err();
        assert!(matches!(
            err,
            RecognitionError::Provider(ProviderError::ImageNotFound(_))
        ));
        assert!(svc.recognition_logs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_reports_entry_count() {
        let svc = services(ScriptedProvider::new(vec![("alice.jpg", vec![vec![0.0]])])).await;
        svc.enroll(Path::new("alice.jpg"), IdentityFields::named("Alice"))
            .await
            .unwrap();
        assert_eq!(svc.reload().await.unwrap(), 1);
    }

    #[test]
    fn test_write_budget_below_store_timeout() {
        assert_eq!(write_budget(Duration::from_secs(5)), Duration::from_secs(4));
        assert!(write_budget(Duration::from_millis(200)) < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_enroll_against_locked_database_leaves_no_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.db");
        let store_timeout = Duration::from_millis(200);
        let store = SqliteStore::open(&path)
            .await
            .unwrap()
            .with_write_budget(write_budget(store_timeout));
        let svc = Services::assemble(
            Arc::new(store),
            Arc::new(ScriptedProvider::new(vec![("ada.jpg", vec![vec![0.1, 0.2]])])),
            0.6,
            store_timeout,
        )
        .await
        .unwrap();

        let other = rusqlite::Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();
        let err = svc
            .enroll(Path::new("ada.jpg"), IdentityFields::named("Ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::StoreUnavailable(_)), "{err}");

        // Give a late write every chance to land before checking.
        tokio::time::sleep(Duration::from_millis(600)).await;
        other.execute_batch("COMMIT").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(svc.list_identities().await.unwrap().is_empty());
        assert_eq!(svc.reload().await.unwrap(), 0);
    }
}
