//! Gallery store: enrolled (label, encoding) reference pairs.
//!
//! Backed by a directory holding one image per identity, where the file stem
//! is the label. The in-memory list is the source of truth while running; the
//! directory is only read at load time and written on enrollment.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::Embedding;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write enrollment image: {0}")]
    Image(#[from] image::ImageError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// What happens when a label is enrolled a second time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollMode {
    /// Keep existing entries; the new encoding becomes an additional reference.
    #[default]
    Append,
    /// Drop existing entries for the label first.
    Replace,
}

impl FromStr for EnrollMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(EnrollMode::Append),
            "replace" => Ok(EnrollMode::Replace),
            other => Err(format!("unknown enroll mode {other:?} (expected append or replace)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub encoding: Embedding,
}

#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    dir: Option<PathBuf>,
    mode: EnrollMode,
}

impl Gallery {
    /// An empty gallery with no backing directory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Build a gallery from every image in `dir`, creating the directory if needed.
    ///
    /// Each file contributes the encoding of its first detected face. Files with
    /// no face, or that are not decodable images, are skipped.
    pub fn load<E: FaceEncoder + ?Sized>(
        dir: impl AsRef<Path>,
        encoder: &mut E,
    ) -> Result<Self, GalleryError> {
        let dir = dir.as_ref();
        let io_err = |source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let Some(label) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let image = match image::open(&path) {
                Ok(img) => img.into_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable gallery file");
                    continue;
                }
            };
            match first_encoding(encoder, &image) {
                Ok(Some(encoding)) => entries.push(GalleryEntry {
                    label: label.to_string(),
                    encoding,
                }),
                Ok(None) => tracing::debug!(path = %path.display(), "no face in gallery image"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping gallery file that failed to encode");
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = entries.len(), "gallery loaded");

        Ok(Self {
            entries,
            dir: Some(dir.to_path_buf()),
            mode: EnrollMode::default(),
        })
    }

    pub fn with_mode(mut self, mode: EnrollMode) -> Self {
        self.mode = mode;
        self
    }

    /// Encode `image` and add it under `label`.
    ///
    /// When directory-backed, the image is saved as `<label>.jpg` only after a
    /// face was found. On any error the gallery is unchanged.
    pub fn enroll<E: FaceEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        label: &str,
        image: &RgbImage,
    ) -> Result<&GalleryEntry, GalleryError> {
        let label = validate_label(label)?;
        let encoding = first_encoding(encoder, image)?.ok_or(GalleryError::NoFaceDetected)?;

        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{label}.jpg"));
            image.save(&path)?;
            tracing::debug!(path = %path.display(), "enrollment image saved");
        }

        if self.mode == EnrollMode::Replace {
            self.entries.retain(|e| e.label != label);
        }
        self.insert(label, encoding);

        tracing::info!(label, mode = ?self.mode, size = self.entries.len(), "enrolled");
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Append an entry without touching the backing directory.
    pub fn insert(&mut self, label: impl Into<String>, encoding: Embedding) {
        self.entries.push(GalleryEntry {
            label: label.into(),
            encoding,
        });
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

    pub fn mode(&self) -> EnrollMode {
        self.mode
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Distinct labels in first-enrolled order.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !labels.contains(&entry.label.as_str()) {
                labels.push(&entry.label);
            }
        }
        labels
    }
}

fn first_encoding<E: FaceEncoder + ?Sized>(
    encoder: &mut E,
    image: &RgbImage,
) -> Result<Option<Embedding>, EncoderError> {
    let faces = encoder.face_locations(image)?;
    match faces.first() {
        Some(face) => Ok(Some(encoder.face_encoding(image, face)?)),
        None => Ok(None),
    }
}

/// Labels become file names, so they must be non-empty and contain no path parts.
fn validate_label(label: &str) -> Result<&str, GalleryError> {
    let trimmed = label.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
    {
        return Err(GalleryError::InvalidLabel(label.to_string()));
    }
    Ok(trimmed)
}
