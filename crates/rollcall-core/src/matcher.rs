//! Nearest-neighbour matching of a probe embedding against a gallery snapshot.

use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, MatchVerdict};

/// Default Euclidean tolerance; lower is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, snapshot: &GallerySnapshot, tolerance: f32)
        -> MatchVerdict;
}

/// Euclidean nearest-neighbour matcher.
///
/// The entry with the smallest distance wins; it is accepted only when that
/// distance is within `tolerance`. There is no runner-up margin check, so two
/// enrolled faces that sit close together can both fall inside tolerance and
/// the nearer one is reported.
///
/// Ties on the minimum distance go to the first entry in snapshot order, which
/// the store defines as ascending identity id. Entries whose dimension differs
/// from the probe are skipped.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &GallerySnapshot,
        tolerance: f32,
    ) -> MatchVerdict {
        let entries = snapshot.entries();
        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        // Always visit every entry; no early exit on a close hit.
        for (i, entry) in entries.iter().enumerate() {
            let distance = match probe.euclidean_distance(&entry.embedding.embedding) {
                Some(d) if d.is_finite() => d,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((i, distance));
            }
        }

        if skipped > 0 {
            tracing::debug!(
                skipped,
                probe_dim = probe.dim(),
                "gallery entries not comparable with probe"
            );
        }

        match best {
            Some((idx, distance)) if distance <= tolerance => MatchVerdict {
                matched: true,
                identity_id: Some(entries[idx].identity.id),
                confidence: (1.0 - distance).clamp(0.0, 1.0),
                distance: Some(distance),
                bounding_box: None,
            },
            Some((_, distance)) => MatchVerdict::unmatched(Some(distance)),
            None => MatchVerdict::unmatched(None),
        }
    }
}
