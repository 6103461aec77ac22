// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process stand-ins for the remote collaborators.
//!
//! Used by tests and by `recall replay`, which drives the memory manager
//! from captured transport streams without a backend.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    HistoryPage, HistoryQuery, HistorySource, MessageRecord, PauseSnapshot, SessionControl,
    SessionId,
};

// ─── History ──────────────────────────────────────────────────────────────────

/// Paginated history served from memory.
#[derive(Default)]
pub struct InMemoryHistory {
    sessions: Mutex<HashMap<SessionId, Vec<MessageRecord>>>,
    /// Number of upcoming fetches that fail before the store answers again.
    fail_next: AtomicU32,
    calls: AtomicUsize,
    queries: Mutex<Vec<HistoryQuery>>,
    delay: Duration,
}

#[derive(Deserialize)]
struct HistoryLine {
    session_id: SessionId,
    #[serde(flatten)]
    message: MessageRecord,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `{"session_id": …, <MessageRecord fields>}` object per line.
    pub fn from_jsonl(text: &str) -> anyhow::Result<Self> {
        let history = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: HistoryLine = serde_json::from_str(line)
                .with_context(|| format!("history line {}", lineno + 1))?;
            history.insert(&parsed.session_id, vec![parsed.message]);
        }
        Ok(history)
    }

    /// Delay every fetch by `delay` (keeps a request observably in flight).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Add messages to a session's stored history.
    pub fn insert(&self, session_id: &str, messages: Vec<MessageRecord>) {
        let mut sessions = lock(&self.sessions);
        let stored = sessions.entry(session_id.to_string()).or_default();
        for m in messages {
            match stored.iter_mut().find(|s| s.id == m.id) {
                Some(existing) => *existing = m,
                None => stored.push(m),
            }
        }
        stored.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of fetches served (including failed ones).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<HistoryQuery> {
        lock(&self.queries).clone()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn page(&self, query: &HistoryQuery) -> anyhow::Result<HistoryPage> {
        let sessions = lock(&self.sessions);
        let Some(stored) = sessions.get(&query.session_id) else {
            return Ok(HistoryPage::default());
        };
        let position = |id: &str| {
            stored
                .iter()
                .position(|m| m.id == id)
                .with_context(|| format!("unknown message id '{id}'"))
        };

        let (start, end) = match (&query.before, &query.after) {
            (Some(before), _) => {
                let end = position(before)?;
                (end.saturating_sub(query.limit), end)
            }
            (None, Some(after)) => {
                let start = position(after)? + 1;
                (start, (start + query.limit).min(stored.len()))
            }
            (None, None) => (stored.len().saturating_sub(query.limit), stored.len()),
        };

        Ok(HistoryPage {
            messages: stored[start..end].to_vec(),
            has_more_before: start > 0,
            has_more_after: end < stored.len(),
        })
    }
}

#[async_trait]
impl HistorySource for InMemoryHistory {
    async fn fetch(&self, query: HistoryQuery) -> anyhow::Result<HistoryPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.queries).push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("history store unavailable");
        }
        self.page(&query)
    }
}

// ─── Session control ──────────────────────────────────────────────────────────

/// Records every remote call; individual operations can be made to fail.
#[derive(Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delay: Duration,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `op` (`"abort"`, `"persist_pause"`, `"resume"`, `"discard_pause"`)
    /// fail until cleared.
    pub fn set_failing(&self, op: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(op.to_string());
        } else {
            set.remove(op);
        }
    }

    /// Calls made so far, formatted as `"<op>:<session_id>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        lock(&self.calls).iter().filter(|c| c.starts_with(&prefix)).count()
    }

    async fn record(&self, op: &str, session_id: &str) -> anyhow::Result<()> {
        lock(&self.calls).push(format!("{op}:{session_id}"));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if lock(&self.failing).contains(op) {
            anyhow::bail!("{op} rejected by backend");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionControl for RecordingControl {
    async fn abort(&self, session_id: &str) -> anyhow::Result<()> {
        self.record("abort", session_id).await
    }

    async fn persist_pause(&self, snapshot: &PauseSnapshot) -> anyhow::Result<()> {
        self.record("persist_pause", &snapshot.session_id).await
    }

    async fn resume(&self, snapshot: &PauseSnapshot) -> anyhow::Result<()> {
        self.record("resume", &snapshot.session_id).await
    }

    async fn discard_pause(&self, session_id: &str) -> anyhow::Result<()> {
        self.record("discard_pause", session_id).await
    }
}

/// Lock a mutex, recovering the data if a panicking test poisoned it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with(n: u64) -> InMemoryHistory {
        let h = InMemoryHistory::new();
        let msgs = (1..=n)
            .map(|i| MessageRecord::user(format!("m{i:03}"), i, format!("msg {i}")))
            .collect();
        h.insert("s1", msgs);
        h
    }

    #[tokio::test]
    async fn latest_page_returns_tail() {
        let h = history_with(10);
        let page = h.fetch(HistoryQuery::latest("s1", 4)).await.unwrap();
        let ids: Vec<_> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m007", "m008", "m009", "m010"]);
        assert!(page.has_more_before);
        assert!(!page.has_more_after);
    }

    #[tokio::test]
    async fn before_cursor_pages_backwards() {
        let h = history_with(10);
        let query = HistoryQuery {
            before: Some("m003".into()),
            ..HistoryQuery::latest("s1", 5)
        };
        let page = h.fetch(query).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.has_more_before);
        assert!(page.has_more_after);
    }

    #[tokio::test]
    async fn after_cursor_pages_forwards() {
        let h = history_with(10);
        let query = HistoryQuery {
            after: Some("m008".into()),
            ..HistoryQuery::latest("s1", 5)
        };
        let page = h.fetch(query).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.has_more_before);
        assert!(!page.has_more_after);
    }

    #[tokio::test]
    async fn fail_next_fails_exactly_n_fetches() {
        let h = history_with(3);
        h.fail_next(2);
        assert!(h.fetch(HistoryQuery::latest("s1", 2)).await.is_err());
        assert!(h.fetch(HistoryQuery::latest("s1", 2)).await.is_err());
        assert!(h.fetch(HistoryQuery::latest("s1", 2)).await.is_ok());
        assert_eq!(h.calls(), 3);
    }

    #[tokio::test]
    async fn unknown_session_yields_empty_complete_page() {
        let h = InMemoryHistory::new();
        let page = h.fetch(HistoryQuery::latest("nope", 5)).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more_before);
    }

    #[test]
    fn from_jsonl_sorts_by_order_key() {
        let text = r#"
{"session_id":"s1","id":"b","role":"assistant","order":2,"parts":[]}
{"session_id":"s1","id":"a","role":"user","order":1,"parts":[{"id":"a0","type":"text","text":"hi"}]}
"#;
        let h = InMemoryHistory::from_jsonl(text).unwrap();
        let stored = lock(&h.sessions);
        let ids: Vec<_> = stored["s1"].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn recording_control_fails_selected_op_only() {
        let c = RecordingControl::new();
        c.set_failing("abort", true);
        assert!(c.abort("s1").await.is_err());
        assert!(c.discard_pause("s1").await.is_ok());
        assert_eq!(c.calls(), ["abort:s1", "discard_pause:s1"]);
        assert_eq!(c.count("abort"), 1);
    }
}
