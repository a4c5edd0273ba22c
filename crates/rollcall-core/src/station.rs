//! Station: owns gallery, recognizer, session tracker and sink, and runs one
//! frame cycle at a time. Has no knowledge of cameras, threads or UI.

use crate::attendance::{AttendanceSink, SinkError};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::{Gallery, GalleryError};
use crate::overlay;
use crate::recognizer::{FrameRecognizer, MatchPolicy};
use crate::session::{MarkEvent, SessionError, SessionSummary, SessionTracker};
use crate::types::Recognition;
use chrono::{DateTime, Local};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("recognition failed: {0}")]
    Encoder(#[from] EncoderError),
}

/// Everything one processed frame produced.
#[derive(Debug)]
pub struct FrameOutcome {
    pub recognitions: Vec<Recognition>,
    /// Marks that were durably recorded.
    pub marks: Vec<MarkEvent>,
    /// Marks whose record failed; these labels stay unmarked.
    pub failed: Vec<(MarkEvent, SinkError)>,
    pub overlay: RgbImage,
}

pub struct Station<S> {
    gallery: Gallery,
    recognizer: FrameRecognizer,
    tracker: SessionTracker,
    sink: S,
}

impl<S: AttendanceSink> Station<S> {
    pub fn new(gallery: Gallery, policy: MatchPolicy, sink: S) -> Self {
        Self {
            gallery,
            recognizer: FrameRecognizer::new(policy),
            tracker: SessionTracker::new(),
            sink,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_session_active(&self) -> bool {
        self.tracker.is_active()
    }

    /// Start a session, returning its id.
    pub fn start(&mut self, subject: &str) -> Result<String, StationError> {
        Ok(self.tracker.start(subject)?.to_string())
    }

    pub fn stop(&mut self) -> Result<SessionSummary, StationError> {
        Ok(self.tracker.stop()?)
    }

    /// Enroll `image` under `label`, returning the new gallery size.
    pub fn enroll<E: FaceEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        label: &str,
        image: &RgbImage,
    ) -> Result<usize, StationError> {
        self.gallery.enroll(encoder, label, image)?;
        Ok(self.gallery.len())
    }

    /// Recognize every face in `frame`, mark first sightings and record them.
    ///
    /// Without an active session the frame is still recognized and annotated,
    /// but nothing is marked.
    pub fn process_frame<E: FaceEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        frame: &RgbImage,
        now: DateTime<Local>,
    ) -> Result<FrameOutcome, StationError> {
        let recognitions = self.recognizer.recognize(encoder, frame, &self.gallery)?;

        let mut marks = Vec::new();
        let mut failed = Vec::new();
        for rec in &recognitions {
            let Some(event) = self.tracker.observe(&rec.identity, rec.confidence, now) else {
                continue;
            };
            match self.sink.record(&event) {
                Ok(()) => marks.push(event),
                Err(e) => {
                    tracing::error!(label = %event.label, error = %e, "failed to record attendance");
                    self.tracker.forget(&event.label);
                    failed.push((event, e));
                }
            }
        }

        let overlay = overlay::annotate(frame, &recognitions);
        Ok(FrameOutcome {
            recognitions,
            marks,
            failed,
            overlay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::AttendanceRecord;
    use crate::encoder::fake::{encoding_of, face_image, PixelEncoder};
    use crate::types::Identity;

    const ALICE: [u8; 3] = [10, 0, 0];
    const BOB: [u8; 3] = [0, 10, 0];

    fn station() -> Station<Vec<AttendanceRecord>> {
        let mut gallery = Gallery::in_memory();
        gallery.insert("alice", encoding_of(ALICE));
        gallery.insert("bob", encoding_of(BOB));
        Station::new(gallery, MatchPolicy::default(), Vec::new())
    }

    /// Fails on every record.
    struct BrokenSink;

    impl AttendanceSink for BrokenSink {
        fn record(&mut self, _event: &MarkEvent) -> Result<(), SinkError> {
            Err(SinkError::Io {
                path: "attendance.csv".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }
    }

    #[test]
    fn test_repeated_frames_record_once() {
        let mut station = station();
        station.start("Math").unwrap();
        let frame = face_image(&[ALICE]);
        for _ in 0..20 {
            station.process_frame(&mut PixelEncoder, &frame, Local::now()).unwrap();
        }
        assert_eq!(station.sink().len(), 1);
        assert_eq!(station.sink()[0].identity, "alice");
    }

    #[test]
    fn test_multiple_marks_in_one_frame() {
        let mut station = station();
        station.start("Math").unwrap();
        let outcome = station
            .process_frame(&mut PixelEncoder, &face_image(&[ALICE, BOB, [90, 90, 90]]), Local::now())
            .unwrap();
        assert_eq!(outcome.recognitions.len(), 3);
        assert_eq!(outcome.recognitions[2].identity, Identity::Unknown);
        let labels: Vec<_> = outcome.marks.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        assert_eq!(station.stop().unwrap().count(), 2);
    }

    #[test]
    fn test_no_marks_without_session() {
        let mut station = station();
        let outcome = station
            .process_frame(&mut PixelEncoder, &face_image(&[ALICE]), Local::now())
            .unwrap();
        assert_eq!(outcome.recognitions.len(), 1);
        assert!(outcome.marks.is_empty());
        assert!(station.sink().is_empty());
    }

    #[test]
    fn test_new_session_marks_again() {
        let mut station = station();
        let frame = face_image(&[ALICE]);

        let first = station.start("Math").unwrap();
        station.process_frame(&mut PixelEncoder, &frame, Local::now()).unwrap();
        station.stop().unwrap();

        let second = station.start("Math").unwrap();
        station.process_frame(&mut PixelEncoder, &frame, Local::now()).unwrap();

        let sessions: Vec<_> = station.sink().iter().map(|r| r.session_id.clone()).collect();
        assert_eq!(sessions, vec![first, second]);
    }

    #[test]
    fn test_sink_failure_keeps_label_unmarked() {
        let mut gallery = Gallery::in_memory();
        gallery.insert("alice", encoding_of(ALICE));
        let mut station = Station::new(gallery, MatchPolicy::default(), BrokenSink);
        station.start("Math").unwrap();

        let frame = face_image(&[ALICE]);
        let outcome = station.process_frame(&mut PixelEncoder, &frame, Local::now()).unwrap();
        assert!(outcome.marks.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(station.tracker().marked_count(), 0);

        // Retried on the next frame
        let outcome = station.process_frame(&mut PixelEncoder, &frame, Local::now()).unwrap();
        assert_eq!(outcome.failed.len(), 1);
    }

    #[test]
    fn test_enroll_then_recognize() {
        let mut station = Station::new(Gallery::in_memory(), MatchPolicy::default(), Vec::new());
        station.start("Art").unwrap();
        let carol = [0, 0, 40];

        let before = station
            .process_frame(&mut PixelEncoder, &face_image(&[carol]), Local::now())
            .unwrap();
        assert_eq!(before.recognitions[0].identity, Identity::Unknown);
        assert_eq!(before.recognitions[0].confidence, 0.0);

        assert_eq!(station.enroll(&mut PixelEncoder, "carol", &face_image(&[carol])).unwrap(), 1);
        let after = station
            .process_frame(&mut PixelEncoder, &face_image(&[carol]), Local::now())
            .unwrap();
        assert_eq!(after.marks.len(), 1);
        assert_eq!(after.marks[0].label, "carol");
    }

    #[test]
    fn test_enroll_no_face() {
        let mut station = station();
        let err = station.enroll(&mut PixelEncoder, "dave", &face_image(&[])).unwrap_err();
        assert!(matches!(err, StationError::Gallery(GalleryError::NoFaceDetected)));
        assert_eq!(station.gallery().len(), 2);
    }

    #[test]
    fn test_start_invalid_subject() {
        let mut station = station();
        let err = station.start(" ").unwrap_err();
        assert!(matches!(err, StationError::Session(SessionError::InvalidSubject)));
        assert!(!station.is_session_active());
    }
}
