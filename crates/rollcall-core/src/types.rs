use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identity key.
pub type IdentityId = i64;

/// Face location in pixel coordinates, in `(top, right, bottom, left)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clamp the box so it lies inside a `width` x `height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1);
        let max_y = height.saturating_sub(1);
        Self {
            top: self.top.min(max_y),
            right: self.right.min(max_x),
            bottom: self.bottom.min(max_y),
            left: self.left.min(max_x),
        }
    }
}

/// Face embedding vector (128-dimensional for dlib-style extractors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance to `other`, or `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

/// One face reported by an embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// Face detection model used by the extractor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionModel {
    /// HOG detector: fast, CPU friendly.
    #[default]
    Hog,
    /// CNN detector: slower, more accurate.
    Cnn,
}

impl DetectionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionModel::Hog => "hog",
            DetectionModel::Cnn => "cnn",
        }
    }
}

impl fmt::Display for DetectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hog" => Ok(DetectionModel::Hog),
            "cnn" => Ok(DetectionModel::Cnn),
            other => Err(format!("unknown detection model: {other} (expected hog or cnn)")),
        }
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFields {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl IdentityFields {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Partial identity update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityPatch {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.age.is_none()
            && self.gender.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.address.is_none()
    }
}

/// A stored embedding linked to its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub id: i64,
    pub identity_id: IdentityId,
    pub embedding: Embedding,
    pub source_image: Option<String>,
}

/// One (identity, embedding) row of the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: FaceEmbedding,
}

impl GalleryEntry {
    /// True when the embedding belongs to the paired identity.
    pub fn is_consistent(&self) -> bool {
        self.embedding.identity_id == self.identity.id
    }
}

/// Outcome of matching one probe against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub matched: bool,
    pub identity_id: Option<IdentityId>,
    /// `1 - distance` clamped to [0, 1] when matched; 0 otherwise.
    pub confidence: f32,
    /// Distance to the nearest comparable gallery entry, if there was one.
    pub distance: Option<f32>,
    pub bounding_box: Option<BoundingBox>,
}

impl MatchVerdict {
    pub fn unmatched(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            identity_id: None,
            confidence: 0.0,
            distance,
            bounding_box: None,
        }
    }

    pub fn with_bounding_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }
}

/// Append-only audit record of one recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionLogEntry {
    pub identity_id: Option<IdentityId>,
    pub confidence: f32,
    pub source_image: String,
    pub recognized_at: DateTime<Utc>,
}

impl RecognitionLogEntry {
    pub fn from_verdict(verdict: &MatchVerdict, source_image: &str, at: DateTime<Utc>) -> Self {
        Self {
            identity_id: if verdict.matched { verdict.identity_id } else { None },
            confidence: if verdict.matched { verdict.confidence } else { 0.0 },
            source_image: source_image.to_string(),
            recognized_at: at,
        }
    }
}

/// A stored log entry joined with the identity it refers to (if it still exists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionLogRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: RecognitionLogEntry,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.25, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_embedding_finite() {
        assert!(Embedding::new(vec![0.1, 0.2]).is_finite());
        assert!(!Embedding::new(vec![0.1, f32::NAN]).is_finite());
    }

    #[test]
    fn test_bounding_box_clamp() {
        let b = BoundingBox { top: 10, right: 700, bottom: 500, left: 20 };
        let clamped = b.clamp_to(640, 480);
        assert_eq!(clamped, BoundingBox { top: 10, right: 639, bottom: 479, left: 20 });
        assert_eq!(clamped.width(), 619);
        assert_eq!(clamped.height(), 469);
    }

    #[test]
    fn test_detection_model_parse() {
        assert_eq!("HOG".parse::<DetectionModel>(), Ok(DetectionModel::Hog));
        assert_eq!(" cnn ".parse::<DetectionModel>(), Ok(DetectionModel::Cnn));
        assert!("yolo".parse::<DetectionModel>().is_err());
        assert_eq!(DetectionModel::default().to_string(), "hog");
    }

    #[test]
    fn test_log_entry_from_unmatched_verdict_drops_identity() {
        let verdict = MatchVerdict {
            matched: false,
            identity_id: Some(7),
            confidence: 0.4,
            distance: Some(0.9),
            bounding_box: None,
        };
        let entry = RecognitionLogEntry::from_verdict(&verdict, "a.jpg", Utc::now());
        assert_eq!(entry.identity_id, None);
        assert_eq!(entry.confidence, 0.0);
        assert_eq!(entry.source_image, "a.jpg");
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(IdentityPatch::default().is_empty());
        let patch = IdentityPatch { phone: Some("555".into()), ..Default::default() };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_identity_fields_deserialize_with_defaults() {
        let fields: IdentityFields = serde_json::from_str(r#"{"name":"Ada","age":36}"#).unwrap();
        assert_eq!(fields.name, "Ada");
        assert_eq!(fields.age, Some(36));
        assert_eq!(fields.email, None);
    }
}
