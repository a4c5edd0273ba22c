//! rollcall-core: Recognition, session dedup and attendance logging.
//!
//! Faces are detected and encoded behind the [`FaceEncoder`] trait (SCRFD +
//! ArcFace via ONNX Runtime in production), matched against a [`Gallery`],
//! deduplicated per session by the [`SessionTracker`], and appended to an
//! [`AttendanceSink`]. [`Station`] ties them together for one frame at a time.

pub mod attendance;
pub mod encoder;
pub mod gallery;
pub mod onnx;
pub mod overlay;
pub mod recognizer;
pub mod session;
pub mod station;
pub mod types;

pub use attendance::{AttendanceRecord, AttendanceSink, CsvAttendanceSink, SinkError};
pub use encoder::{EncoderError, FaceEncoder};
pub use gallery::{EnrollMode, Gallery, GalleryEntry, GalleryError};
pub use onnx::OnnxFaceEncoder;
pub use recognizer::{FrameRecognizer, MatchPolicy};
pub use session::{MarkEvent, SessionError, SessionSummary, SessionTracker};
pub use station::{FrameOutcome, Station, StationError};
pub use types::{BoundingBox, Detection, Embedding, Identity, Recognition};
