//! ONNX Runtime backed [`FaceEncoder`]: SCRFD detection, landmark alignment, ArcFace encoding.

pub mod alignment;
pub mod arcface;
pub mod detector;

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};

pub use arcface::ArcFaceEncoder;
pub use detector::ScrfdDetector;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

pub struct OnnxFaceEncoder {
    detector: ScrfdDetector,
    arcface: ArcFaceEncoder,
}

impl OnnxFaceEncoder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let (det_path, rec_path) = model_paths(model_dir);
        Ok(Self {
            detector: ScrfdDetector::load(&det_path)?,
            arcface: ArcFaceEncoder::load(&rec_path)?,
        })
    }
}

/// Expected detector and encoder model paths inside `model_dir`.
pub fn model_paths(model_dir: &Path) -> (PathBuf, PathBuf) {
    (model_dir.join(SCRFD_MODEL_FILE), model_dir.join(ARCFACE_MODEL_FILE))
}

impl FaceEncoder for OnnxFaceEncoder {
    fn face_locations(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
        self.detector.detect(image)
    }

    fn face_encoding(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError> {
        let landmarks = face.landmarks.as_ref().ok_or(EncoderError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        self.arcface.encode(&aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths() {
        let (det, rec) = model_paths(Path::new("/opt/models"));
        assert_eq!(det, Path::new("/opt/models/det_10g.onnx"));
        assert_eq!(rec, Path::new("/opt/models/w600k_r50.onnx"));
    }

    #[test]
    fn test_load_missing_dir() {
        let err = OnnxFaceEncoder::load(Path::new("/nonexistent")).err().unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(p) if p.ends_with(SCRFD_MODEL_FILE)));
    }
}
