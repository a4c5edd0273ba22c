//! The face detection and encoding seam.
//!
//! Everything above this trait (gallery, recognizer, station) only sees
//! bounding boxes and encodings. [`crate::onnx::OnnxFaceEncoder`] is the
//! production implementation.

use crate::types::{BoundingBox, Detection, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects faces in an RGB frame and turns each one into an encoding.
pub trait FaceEncoder {
    /// Bounding boxes of all faces in the frame, best first.
    fn face_locations(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError>;

    /// Encoding for one face previously returned by [`face_locations`](Self::face_locations).
    fn face_encoding(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError>;

    /// Locate every face and encode each one, preserving detector order.
    fn face_encodings(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EncoderError> {
        let boxes = self.face_locations(image)?;
        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let encoding = self.face_encoding(image, &bbox)?;
            detections.push(Detection { bbox, encoding });
        }
        Ok(detections)
    }
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn face_locations(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
        (**self).face_locations(image)
    }

    fn face_encoding(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError> {
        (**self).face_encoding(image, face)
    }
}

/// Deterministic encoder for tests, also exported with the `test-support` feature.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use image::Rgb;

    /// Test encoder: every non-black pixel in row 0 is a "face" at that column,
    /// encoded as its RGB channels divided by 100.
    pub struct PixelEncoder;

    pub fn face_image(faces: &[[u8; 3]]) -> RgbImage {
        let width = faces.len().max(1) as u32;
        let mut img = RgbImage::new(width, 2);
        for (x, rgb) in faces.iter().enumerate() {
            img.put_pixel(x as u32, 0, Rgb(*rgb));
        }
        img
    }

    pub fn encoding_of(rgb: [u8; 3]) -> Embedding {
        Embedding::new(rgb.iter().map(|&c| c as f32 / 100.0).collect())
    }

    impl FaceEncoder for PixelEncoder {
        fn face_locations(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
            Ok((0..image.width())
                .filter(|&x| image.get_pixel(x, 0).0 != [0, 0, 0])
                .map(|x| BoundingBox {
                    x: x as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    score: 1.0,
                    landmarks: None,
                })
                .collect())
        }

        fn face_encoding(
            &mut self,
            image: &RgbImage,
            face: &BoundingBox,
        ) -> Result<Embedding, EncoderError> {
            Ok(encoding_of(image.get_pixel(face.x as u32, 0).0))
        }
    }
}
