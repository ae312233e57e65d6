use crate::config::Config;
use crate::service::Services;
use rollcall_core::{
    DetectionModel, EnrollmentError, IdentityFields, IdentityPatch, ProviderError,
    RecognitionError, StoreError,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Gallery1";
pub const OBJECT_PATH: &str = "/org/rollcall/Gallery1";

/// D-Bus interface for the rollcall gallery daemon.
///
/// Bus name: org.rollcall.Gallery1
/// Object path: /org/rollcall/Gallery1
///
/// Structured results travel as JSON strings.
///
/// Image paths are opened with the daemon's privileges and every method can
/// change or read the roster. On the system bus, restrict callers with a
/// D-Bus policy (see `dist/dbus/org.rollcall.Gallery1.conf`).
pub struct GalleryService {
    services: Services,
    db_path: PathBuf,
    detection_model: DetectionModel,
    upsample: u32,
}

impl GalleryService {
    pub fn new(services: Services, config: &Config) -> Self {
        Self {
            services,
            db_path: config.db_path.clone(),
            detection_model: config.detection_model,
            upsample: config.upsample,
        }
    }
}

#[interface(name = "org.rollcall.Gallery1")]
impl GalleryService {
    /// Identify every face in the image at `image_path`.
    async fn recognize(&self, image_path: &str) -> fdo::Result<String> {
        tracing::info!(image_path, "recognize requested");
        let report = self
            .services
            .recognize(Path::new(image_path))
            .await
            .map_err(recognition_error)?;
        to_json(&report)
    }

    /// Enroll the single face in `image_path` under the identity fields in `fields_json`.
    async fn enroll(&self, image_path: &str, fields_json: &str) -> fdo::Result<String> {
        tracing::info!(image_path, "enroll requested");
        let fields: IdentityFields = serde_json::from_str(fields_json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("identity fields: {e}")))?;
        let identity = self
            .services
            .enroll(Path::new(image_path), fields)
            .await
            .map_err(enrollment_error)?;
        to_json(&identity)
    }

    /// Apply the partial update in `patch_json` to identity `id`.
    async fn update_identity(&self, id: i64, patch_json: &str) -> fdo::Result<String> {
        tracing::info!(id, "update_identity requested");
        let patch: IdentityPatch = serde_json::from_str(patch_json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("identity patch: {e}")))?;
        let identity = self
            .services
            .update_identity(id, patch)
            .await
            .map_err(enrollment_error)?;
        to_json(&identity)
    }

    /// Remove identity `id` and its embeddings.
    async fn remove_identity(&self, id: i64) -> fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        self.services
            .remove_identity(id)
            .await
            .map_err(enrollment_error)?;
        Ok(true)
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.services.list_identities().await.map_err(store_error)?;
        to_json(&identities)
    }

    /// Most recent recognition attempts, newest first.
    async fn recognition_logs(&self, limit: u32) -> fdo::Result<String> {
        let logs = self
            .services
            .recognition_logs(limit)
            .await
            .map_err(store_error)?;
        to_json(&logs)
    }

    /// Reload the gallery from the store; returns the number of entries.
    async fn reload(&self) -> fdo::Result<u32> {
        tracing::info!("reload requested");
        let entries = self.services.reload().await.map_err(store_error)?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gallery_entries": self.services.gallery_size(),
            "identities": self.services.enrolled_identities(),
            "tolerance": self.services.tolerance(),
            "detection_model": self.detection_model,
            "upsample": self.upsample,
            "db_path": self.db_path.display().to_string(),
        })
        .to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn provider_error(e: ProviderError) -> fdo::Error {
    match e {
        ProviderError::ImageNotFound(path) => fdo::Error::FileNotFound(path),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn recognition_error(e: RecognitionError) -> fdo::Error {
    tracing::warn!(error = %e, "recognition failed");
    match e {
        RecognitionError::Provider(e) => provider_error(e),
    }
}

fn enrollment_error(e: EnrollmentError) -> fdo::Error {
    tracing::warn!(error = %e, "gallery write failed");
    match e {
        EnrollmentError::Provider(e) => provider_error(e),
        e if e.is_caller_error() => fdo::Error::InvalidArgs(e.to_string()),
        e => fdo::Error::Failed(e.to_string()),
    }
}

fn store_error(e: StoreError) -> fdo::Error {
    tracing::warn!(error = %e, "store request failed");
    fdo::Error::Failed(e.to_string())
}
