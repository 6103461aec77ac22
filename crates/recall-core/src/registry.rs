// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Directory → sessions index and the single current session.
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use recall_model::{Session, SessionId, SessionPatch};

use crate::error::{MemoryError, Result};

/// Result of a transport metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOutcome {
    Created,
    Updated,
    Unchanged,
    /// Unknown session and the patch carries no directory to create it from.
    Ignored,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_directory: HashMap<PathBuf, BTreeSet<SessionId>>,
    current: Option<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Insert or replace a full session.  Returns `true` if it was new.
    pub fn upsert_session(&mut self, session: Session) -> bool {
        let id = session.id.clone();
        let previous = self.sessions.insert(id.clone(), session);
        if let Some(old) = &previous {
            self.unindex(&old.directory, &id);
        }
        self.index(&id);
        previous.is_none()
    }

    /// Merge-patch from the transport.  An unknown session is created when
    /// the patch names its directory.
    pub fn apply_session_metadata(&mut self, patch: &SessionPatch) -> MetadataOutcome {
        if self.contains(&patch.id) {
            return match self.patch_existing(patch) {
                true => MetadataOutcome::Updated,
                false => MetadataOutcome::Unchanged,
            };
        }
        match patch.clone().into_session() {
            Some(session) => {
                debug!(session_id = %session.id, "session created from metadata update");
                self.upsert_session(session);
                MetadataOutcome::Created
            }
            None => {
                debug!(session_id = %patch.id, "metadata for unknown session ignored");
                MetadataOutcome::Ignored
            }
        }
    }

    /// Merge-patch from the application; the session must exist.
    pub fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<bool> {
        if !self.contains(id) {
            return Err(MemoryError::UnknownSession(id.to_string()));
        }
        let patch = SessionPatch {
            id: id.to_string(),
            ..patch.clone()
        };
        Ok(self.patch_existing(&patch))
    }

    fn patch_existing(&mut self, patch: &SessionPatch) -> bool {
        let Some(session) = self.sessions.get_mut(&patch.id) else {
            return false;
        };
        let old_dir = session.directory.clone();
        let changed = session.apply(patch);
        if session.directory != old_dir {
            self.unindex(&old_dir, &patch.id);
            self.index(&patch.id);
        }
        changed
    }

    pub fn remove_session(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.unindex(&session.directory, id);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        Some(session)
    }

    /// Sessions of `directory`, most recently updated first (ties by id).
    pub fn get_sessions_by_directory(&self, directory: &Path) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .by_directory
            .get(directory)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id).cloned())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Make `id` current.  Returns the previously current session.
    pub fn set_current(&mut self, id: &str) -> Result<Option<SessionId>> {
        if !self.contains(id) {
            return Err(MemoryError::UnknownSession(id.to_string()));
        }
        Ok(self.current.replace(id.to_string()))
    }

    fn index(&mut self, id: &str) {
        if let Some(session) = self.sessions.get(id) {
            self.by_directory
                .entry(session.directory.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn unindex(&mut self, directory: &Path, id: &str) {
        if let Some(ids) = self.by_directory.get_mut(directory) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_directory.remove(directory);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn session(id: &str, dir: &str, age_secs: i64) -> Session {
        let at = Utc::now() - Duration::seconds(age_secs);
        Session {
            id: id.into(),
            directory: dir.into(),
            title: id.into(),
            shared: false,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn sessions_by_directory_newest_first() {
        let mut r = SessionRegistry::new();
        r.upsert_session(session("old", "/p", 300));
        r.upsert_session(session("new", "/p", 10));
        r.upsert_session(session("other", "/q", 0));
        let ids: Vec<_> = r
            .get_sessions_by_directory(Path::new("/p"))
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, ["new", "old"]);
        assert!(r.get_sessions_by_directory(Path::new("/none")).is_empty());
    }

    #[test]
    fn metadata_creates_session_with_directory_only() {
        let mut r = SessionRegistry::new();
        assert_eq!(
            r.apply_session_metadata(&SessionPatch::new("s1").title("x")),
            MetadataOutcome::Ignored
        );
        assert_eq!(
            r.apply_session_metadata(&SessionPatch::new("s1").directory("/p")),
            MetadataOutcome::Created
        );
        assert_eq!(
            r.apply_session_metadata(&SessionPatch::new("s1").title("t")),
            MetadataOutcome::Updated
        );
        assert_eq!(
            r.apply_session_metadata(&SessionPatch::new("s1").title("t")),
            MetadataOutcome::Unchanged
        );
    }

    #[test]
    fn directory_change_reindexes() {
        let mut r = SessionRegistry::new();
        r.upsert_session(session("s1", "/a", 0));
        r.update_session("s1", &SessionPatch::new("s1").directory("/b")).unwrap();
        assert!(r.get_sessions_by_directory(Path::new("/a")).is_empty());
        assert_eq!(r.get_sessions_by_directory(Path::new("/b")).len(), 1);
    }

    #[test]
    fn update_unknown_session_is_an_error() {
        let mut r = SessionRegistry::new();
        let err = r.update_session("ghost", &SessionPatch::new("ghost").title("x")).unwrap_err();
        assert_eq!(err, MemoryError::UnknownSession("ghost".into()));
    }

    #[test]
    fn set_current_returns_previous_and_remove_clears_it() {
        let mut r = SessionRegistry::new();
        r.upsert_session(session("a", "/p", 0));
        r.upsert_session(session("b", "/p", 0));
        assert_eq!(r.set_current("a").unwrap(), None);
        assert_eq!(r.set_current("b").unwrap().as_deref(), Some("a"));
        assert!(r.set_current("zzz").is_err());
        assert_eq!(r.current(), Some("b"));
        r.remove_session("b");
        assert_eq!(r.current(), None);
        assert_eq!(r.len(), 1);
    }
}
