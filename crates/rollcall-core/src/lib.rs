//! rollcall-core — Face gallery matching engine.
//!
//! Holds the in-memory gallery of enrolled face embeddings, keeps it in sync
//! with a durable store, matches probe embeddings by Euclidean distance, and
//! records every recognition attempt.

pub mod audit;
pub mod enroll;
pub mod gallery;
pub mod matcher;
pub mod provider;
pub mod recognize;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use audit::{AuditError, RecognitionAuditor};
pub use enroll::{EnrollmentCoordinator, EnrollmentError};
pub use gallery::{FaceGallery, GallerySnapshot};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use provider::{EmbeddingProvider, ProviderError};
pub use recognize::{Recognition, RecognitionError, RecognitionReport, Recognizer};
pub use store::{GalleryStore, StoreError};
pub use types::{
    BoundingBox, DetectedFace, DetectionModel, Embedding, FaceEmbedding, GalleryEntry, Identity,
    IdentityFields, IdentityId, IdentityPatch, MatchVerdict, RecognitionLogEntry,
    RecognitionLogRecord,
};
