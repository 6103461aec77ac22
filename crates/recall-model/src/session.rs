// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifiers are opaque strings assigned by the backend (or a v4
/// UUID for sessions created locally).
pub type SessionId = String;

/// Metadata of one conversation.
///
/// Only metadata and timestamps ever change; the messages live in the
/// memory manager's windows and in the backend history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Working directory the session belongs to.  Sessions are grouped by it.
    pub directory: PathBuf,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub shared: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(directory: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            directory: directory.into(),
            title: title.into(),
            shared: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge-patch: fields absent from `patch` are left untouched.
    ///
    /// Returns `true` when anything changed.
    pub fn apply(&mut self, patch: &SessionPatch) -> bool {
        let before = self.clone();
        if let Some(directory) = &patch.directory {
            self.directory = directory.clone();
        }
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(shared) = patch.shared {
            self.shared = shared;
        }
        if let Some(updated_at) = patch.updated_at {
            // Timestamps only move forward; a stale redelivery must not
            // reorder the recency list.
            if updated_at > self.updated_at {
                self.updated_at = updated_at;
            }
        }
        *self != before
    }
}

/// Partial session update.  Every `None` field means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Build a full session from a patch that names its directory.
    ///
    /// Used when the backend reports a session the client has not seen yet.
    pub fn into_session(self) -> Option<Session> {
        let directory = self.directory?;
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Some(Session {
            id: self.id,
            directory,
            title: self.title.unwrap_or_default(),
            shared: self.shared.unwrap_or(false),
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new("/tmp/a", "one");
        let b = Session::new("/tmp/a", "two");
        assert_ne!(a.id, b.id);
        assert_eq!(a.created_at, a.updated_at);
    }

    #[test]
    fn apply_leaves_unspecified_fields_untouched() {
        let mut s = Session::new("/work/project", "original");
        s.shared = true;
        let changed = s.apply(&SessionPatch::new(&s.id).title("renamed"));
        assert!(changed);
        assert_eq!(s.title, "renamed");
        assert_eq!(s.directory, PathBuf::from("/work/project"));
        assert!(s.shared, "shared flag must survive a title-only patch");
    }

    #[test]
    fn apply_empty_patch_reports_no_change() {
        let mut s = Session::new("/work", "t");
        assert!(!s.apply(&SessionPatch::new(&s.id)));
    }

    #[test]
    fn apply_ignores_older_updated_at() {
        let mut s = Session::new("/work", "t");
        let original = s.updated_at;
        s.apply(&SessionPatch::new(&s.id).updated_at(original - Duration::seconds(30)));
        assert_eq!(s.updated_at, original);
        s.apply(&SessionPatch::new(&s.id).updated_at(original + Duration::seconds(30)));
        assert!(s.updated_at > original);
    }

    #[test]
    fn into_session_requires_directory() {
        assert!(SessionPatch::new("s1").title("x").into_session().is_none());
        let s = SessionPatch::new("s1").directory("/d").into_session().unwrap();
        assert_eq!(s.id, "s1");
        assert_eq!(s.directory, PathBuf::from("/d"));
        assert!(!s.shared);
    }

    #[test]
    fn patch_json_omits_absent_fields() {
        let json = serde_json::to_string(&SessionPatch::new("s1").shared(true)).unwrap();
        assert_eq!(json, r#"{"id":"s1","shared":true}"#);
    }
}
