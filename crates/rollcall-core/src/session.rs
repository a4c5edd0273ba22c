//! Session tracker: dedups recognitions so each identity is marked once per session.

use crate::types::Identity;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("subject must not be empty")]
    InvalidSubject,
    #[error("a session is already active ({0})")]
    AlreadyActive(String),
    #[error("no active session")]
    NotActive,
}

/// First recognition of an identity within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkEvent {
    pub session_id: String,
    pub label: String,
    pub subject: String,
    pub timestamp: DateTime<Local>,
    pub confidence: f32,
}

/// Returned by [`SessionTracker::stop`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub subject: String,
    pub started_at: DateTime<Local>,
    /// Labels in the order they were marked.
    pub marked: Vec<String>,
}

impl SessionSummary {
    pub fn count(&self) -> usize {
        self.marked.len()
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: String,
    subject: String,
    started_at: DateTime<Local>,
    marked: HashSet<String>,
    order: Vec<String>,
}

/// INACTIVE / ACTIVE state machine.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: Option<ActiveSession>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.id.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.subject.as_str())
    }

    pub fn marked_count(&self) -> usize {
        self.active.as_ref().map_or(0, |s| s.order.len())
    }

    /// Begin a session under `subject`, returning the new session id.
    pub fn start(&mut self, subject: &str) -> Result<&str, SessionError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(SessionError::InvalidSubject);
        }
        if let Some(current) = &self.active {
            return Err(SessionError::AlreadyActive(current.id.clone()));
        }

        let id = new_session_id();
        tracing::info!(session = %id, subject, "session started");

        let session = self.active.insert(ActiveSession {
            id,
            subject: subject.to_string(),
            started_at: Local::now(),
            marked: HashSet::new(),
            order: Vec::new(),
        });
        Ok(&session.id)
    }

    /// Mark `identity` present if this is its first sighting in the active session.
    pub fn observe(
        &mut self,
        identity: &Identity,
        confidence: f32,
        timestamp: DateTime<Local>,
    ) -> Option<MarkEvent> {
        let session = self.active.as_mut()?;
        let label = identity.label()?;
        if !session.marked.insert(label.to_string()) {
            return None;
        }
        session.order.push(label.to_string());

        tracing::info!(session = %session.id, label, confidence, "marked present");

        Some(MarkEvent {
            session_id: session.id.clone(),
            label: label.to_string(),
            subject: session.subject.clone(),
            timestamp,
            confidence,
        })
    }

    /// Undo a mark whose attendance record could not be written.
    pub fn forget(&mut self, label: &str) {
        if let Some(session) = self.active.as_mut() {
            if session.marked.remove(label) {
                session.order.retain(|l| l != label);
            }
        }
    }

    /// End the active session.
    pub fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        let session = self.active.take().ok_or(SessionError::NotActive)?;
        tracing::info!(session = %session.id, marked = session.order.len(), "session stopped");
        Ok(SessionSummary {
            session_id: session.id,
            subject: session.subject,
            started_at: session.started_at,
            marked: session.order,
        })
    }
}

/// Short opaque token: the first 8 hex digits of a v4 UUID.
fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(label: &str) -> Identity {
        Identity::Known(label.into())
    }

    #[test]
    fn test_start_rejects_empty_subject() {
        let mut tracker = SessionTracker::new();
        assert_eq!(tracker.start("").unwrap_err(), SessionError::InvalidSubject);
        assert_eq!(tracker.start("  \t").unwrap_err(), SessionError::InvalidSubject);
        assert!(!tracker.is_active());
        assert!(tracker.observe(&known("alice"), 0.9, Local::now()).is_none());
    }

    #[test]
    fn test_observe_marks_once_per_session() {
        let mut tracker = SessionTracker::new();
        tracker.start("Math").unwrap();

        let first = tracker.observe(&known("alice"), 0.8, Local::now());
        let event = first.expect("first sighting should mark");
        assert_eq!(event.label, "alice");
        assert_eq!(event.subject, "Math");
        assert_eq!(Some(event.session_id.as_str()), tracker.session_id());

        for _ in 0..50 {
            assert!(tracker.observe(&known("alice"), 0.95, Local::now()).is_none());
        }
        assert_eq!(tracker.marked_count(), 1);
    }

    #[test]
    fn test_observe_ignores_unknown() {
        let mut tracker = SessionTracker::new();
        tracker.start("Math").unwrap();
        assert!(tracker.observe(&Identity::Unknown, 0.3, Local::now()).is_none());
        assert_eq!(tracker.marked_count(), 0);
    }

    #[test]
    fn test_stop_reports_count_and_next_session_resets() {
        let mut tracker = SessionTracker::new();
        let first_id = tracker.start("Math").unwrap().to_string();
        tracker.observe(&known("alice"), 0.9, Local::now()).unwrap();
        tracker.observe(&known("bob"), 0.9, Local::now()).unwrap();

        let summary = tracker.stop().unwrap();
        assert_eq!(summary.count(), 2);
        assert_eq!(summary.marked, vec!["alice", "bob"]);
        assert_eq!(summary.session_id, first_id);
        assert!(!tracker.is_active());

        let second_id = tracker.start("Physics").unwrap().to_string();
        assert_ne!(first_id, second_id);
        let again = tracker.observe(&known("alice"), 0.9, Local::now()).unwrap();
        assert_eq!(again.subject, "Physics");
        assert_eq!(again.session_id, second_id);
    }

    #[test]
    fn test_start_while_active_fails() {
        let mut tracker = SessionTracker::new();
        let id = tracker.start("Math").unwrap().to_string();
        assert_eq!(tracker.start("Art").unwrap_err(), SessionError::AlreadyActive(id));
        assert_eq!(tracker.subject(), Some("Math"));
    }

    #[test]
    fn test_stop_while_inactive_fails() {
        let mut tracker = SessionTracker::new();
        assert_eq!(tracker.stop().unwrap_err(), SessionError::NotActive);
    }

    #[test]
    fn test_forget_allows_remark() {
        let mut tracker = SessionTracker::new();
        tracker.start("Math").unwrap();
        tracker.observe(&known("alice"), 0.9, Local::now()).unwrap();
        tracker.forget("alice");
        assert_eq!(tracker.marked_count(), 0);
        assert!(tracker.observe(&known("alice"), 0.9, Local::now()).is_some());
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
