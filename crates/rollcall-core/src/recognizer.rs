//! Per-frame recognition: nearest gallery entry with a double-gated acceptance rule.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::{Gallery, GalleryEntry};
use crate::types::{Embedding, Identity, Recognition};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Hard distance cutoff for accepting the nearest gallery entry.
///
/// For unit-length encodings `d² = 2 - 2·cos`, so 0.55 requires a cosine
/// similarity above ~0.85. ArcFace matches of the same person under webcam
/// conditions usually land around 0.5-0.7 cosine (distance 0.77-1.0); raise
/// `ROLLCALL_ACCEPTANCE_THRESHOLD` and `ROLLCALL_MATCH_TOLERANCE` together
/// when known faces keep showing as Unknown.
pub const DEFAULT_ACCEPTANCE_THRESHOLD: f32 = 0.55;
/// Tolerance of the coarse boolean match test (cosine ~0.82 for unit vectors).
pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;

/// Acceptance thresholds. A face is accepted only when both gates agree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Nearest distance must be strictly below this.
    pub acceptance_threshold: f32,
    /// Coarse match test: distance must be at most this.
    pub match_tolerance: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            match_tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

/// Distance from `query` to every gallery entry, in gallery order.
pub fn face_distance(gallery: &[GalleryEntry], query: &Embedding) -> Vec<f32> {
    gallery
        .iter()
        .map(|entry| entry.encoding.distance(query))
        .collect()
}

/// Coarse per-entry match test: `distance <= tolerance`.
pub fn compare_faces(gallery: &[GalleryEntry], query: &Embedding, tolerance: f32) -> Vec<bool> {
    face_distance(gallery, query)
        .into_iter()
        .map(|d| d <= tolerance)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct FrameRecognizer {
    policy: MatchPolicy,
}

impl FrameRecognizer {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Detect, encode and classify every face in the frame.
    ///
    /// An empty gallery or a frame without faces is not an error; only a
    /// failing encoder is.
    pub fn recognize<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
        frame: &RgbImage,
        gallery: &Gallery,
    ) -> Result<Vec<Recognition>, EncoderError> {
        let detections = encoder.face_encodings(frame)?;
        Ok(detections
            .into_iter()
            .map(|det| {
                let (identity, confidence) = self.classify(&det.encoding, gallery.entries());
                Recognition {
                    bbox: det.bbox,
                    identity,
                    confidence,
                }
            })
            .collect())
    }

    /// Nearest-entry decision for one encoding.
    pub fn classify(&self, query: &Embedding, gallery: &[GalleryEntry]) -> (Identity, f32) {
        let distances = face_distance(gallery, query);
        let matches = compare_faces(gallery, query, self.policy.match_tolerance);

        let Some((best_idx, best_distance)) = distances
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return (Identity::Unknown, 0.0);
        };

        let confidence = 1.0 - best_distance;
        if matches[best_idx] && best_distance < self.policy.acceptance_threshold {
            (Identity::Known(gallery[best_idx].label.clone()), confidence)
        } else {
            (Identity::Unknown, confidence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fake::{face_image, PixelEncoder};

    fn entry(label: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            label: label.into(),
            encoding: Embedding::new(values),
        }
    }

    #[test]
    fn test_classify_accepts_close_match() {
        let gallery = vec![entry("alice", vec![0.0, 0.0]), entry("bob", vec![1.0, 0.0])];
        let (identity, confidence) =
            FrameRecognizer::default().classify(&Embedding::new(vec![0.9, 0.0]), &gallery);
        assert_eq!(identity, Identity::Known("bob".into()));
        assert!((confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_classify_rejects_above_threshold() {
        // 0.60 passes the coarse test (<= 0.6) but not the hard cutoff
        let gallery = vec![entry("alice", vec![0.0])];
        let (identity, confidence) =
            FrameRecognizer::default().classify(&Embedding::new(vec![0.6]), &gallery);
        assert_eq!(identity, Identity::Unknown);
        assert!((confidence - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_classify_requires_coarse_match() {
        // Hard cutoff would accept 0.5, but a stricter tolerance vetoes it
        let recognizer = FrameRecognizer::new(MatchPolicy {
            acceptance_threshold: 0.55,
            match_tolerance: 0.4,
        });
        let gallery = vec![entry("alice", vec![0.0])];
        let (identity, _) = recognizer.classify(&Embedding::new(vec![0.5]), &gallery);
        assert_eq!(identity, Identity::Unknown);
    }

    #[test]
    fn test_classify_empty_gallery() {
        let (identity, confidence) =
            FrameRecognizer::default().classify(&Embedding::new(vec![0.1, 0.2]), &[]);
        assert_eq!(identity, Identity::Unknown);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_classify_picks_nearest_of_duplicates() {
        let gallery = vec![
            entry("alice", vec![0.5]),
            entry("alice", vec![0.1]),
            entry("carol", vec![0.3]),
        ];
        let (identity, confidence) =
            FrameRecognizer::default().classify(&Embedding::new(vec![0.0]), &gallery);
        assert_eq!(identity, Identity::Known("alice".into()));
        assert!((confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_compare_faces_tolerance_inclusive() {
        let gallery = vec![entry("a", vec![0.0]), entry("b", vec![1.0])];
        assert_eq!(
            compare_faces(&gallery, &Embedding::new(vec![0.5]), 0.5),
            vec![true, true]
        );
        assert_eq!(
            compare_faces(&gallery, &Embedding::new(vec![0.2]), 0.5),
            vec![true, false]
        );
    }

    #[test]
    fn test_recognize_multiple_faces() {
        let mut gallery = Gallery::in_memory();
        gallery.insert("alice", Embedding::new(vec![0.1, 0.0, 0.0]));
        let frame = face_image(&[[10, 0, 0], [90, 90, 90]]);

        let results = FrameRecognizer::default()
            .recognize(&mut PixelEncoder, &frame, &gallery)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].identity, Identity::Known("alice".into()));
        assert_eq!(results[1].identity, Identity::Unknown);
    }

    #[test]
    fn test_recognize_empty_gallery_all_unknown() {
        let gallery = Gallery::in_memory();
        let frame = face_image(&[[10, 0, 0], [20, 0, 0]]);
        let results = FrameRecognizer::default()
            .recognize(&mut PixelEncoder, &frame, &gallery)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.identity == Identity::Unknown && r.confidence == 0.0));
    }

    #[test]
    fn test_default_threshold_cosine_boundary() {
        // Unit vectors at the given cosine similarity
        let at_cos = |cos: f32| Embedding::new(vec![cos, (1.0 - cos * cos).sqrt()]);
        let gallery = vec![GalleryEntry {
            label: "alice".into(),
            encoding: Embedding::new(vec![1.0, 0.0]),
        }];
        let recognizer = FrameRecognizer::default();
        assert!(recognizer.classify(&at_cos(0.86), &gallery).0.is_known());
        assert_eq!(recognizer.classify(&at_cos(0.84), &gallery).0, Identity::Unknown);
    }

    #[test]
    fn test_recognize_no_faces() {
        let mut gallery = Gallery::in_memory();
        gallery.insert("alice", Embedding::new(vec![0.1, 0.0, 0.0]));
        let results = FrameRecognizer::default()
            .recognize(&mut PixelEncoder, &face_image(&[]), &gallery)
            .unwrap();
        assert!(results.is_empty());
    }
}
