// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded, ordered message buffer of one session plus its viewport and
//! pagination bookkeeping.
use std::collections::HashMap;
use std::ops::Range;
use std::time::Instant;

use serde::Serialize;
use tracing::trace;

use recall_model::{MessageRecord, Part, Role};

/// Where the user is reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message_id", rename_all = "snake_case")]
pub enum ViewportAnchor {
    /// Following the newest message.
    #[default]
    LiveEdge,
    /// Scrolled back; the id of the message at the read position.
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadDirection {
    /// Older history.
    Up,
    /// Newer messages cut off by an earlier trim.
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrimReport {
    pub removed_head: usize,
    pub removed_tail: usize,
    pub retained: usize,
}

impl TrimReport {
    pub fn removed(&self) -> usize {
        self.removed_head + self.removed_tail
    }
}

// ─── Window ───────────────────────────────────────────────────────────────────

/// Messages of one session, strictly ordered by `(order, id)`, ids unique.
#[derive(Debug, Default)]
pub struct MessageWindow {
    messages: Vec<MessageRecord>,
    /// id → order key, used to locate a record without a linear scan.
    orders: HashMap<String, u64>,
}

enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&MessageRecord> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        let order = *self.orders.get(id)?;
        self.search(order, id).ok()
    }

    pub fn first_id(&self) -> Option<&str> {
        self.messages.first().map(|m| m.id.as_str())
    }

    pub fn last_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.id.as_str())
    }

    /// Merge a batch of records.  Safe under duplicated, overlapping and
    /// reordered delivery.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = MessageRecord>) -> MergeStats {
        let mut stats = MergeStats::default();
        for record in batch {
            match self.upsert(record) {
                Upsert::Inserted => stats.inserted += 1,
                Upsert::Updated => stats.updated += 1,
                Upsert::Unchanged => {}
            }
        }
        stats
    }

    /// Upsert one part of a (possibly not yet seen) message.
    pub fn upsert_part(&mut self, message_id: &str, role: Role, order: u64, part: Part) -> MergeStats {
        self.merge([MessageRecord::new(message_id, role, order).with_part(part)])
    }

    fn upsert(&mut self, record: MessageRecord) -> Upsert {
        let Some(&old_order) = self.orders.get(&record.id) else {
            let at = match self.search(record.order, &record.id) {
                Ok(at) | Err(at) => at,
            };
            self.orders.insert(record.id.clone(), record.order);
            self.messages.insert(at, record);
            return Upsert::Inserted;
        };

        let Ok(at) = self.search(old_order, &record.id) else {
            // Index and buffer disagree; rebuild rather than corrupt order.
            self.reindex();
            return self.upsert(record);
        };

        if old_order == record.order {
            return if self.messages[at].merge_from(record) {
                Upsert::Updated
            } else {
                Upsert::Unchanged
            };
        }

        // The server moved the record: take it out and reinsert at its new key.
        trace!(message_id = %record.id, old_order, new_order = record.order, "order key changed");
        let mut existing = self.messages.remove(at);
        existing.merge_from(record);
        self.orders.insert(existing.id.clone(), existing.order);
        let to = match self.search(existing.order, &existing.id) {
            Ok(to) | Err(to) => to,
        };
        self.messages.insert(to, existing);
        Upsert::Updated
    }

    /// Keep only `range`, dropping everything else.
    pub fn retain_range(&mut self, range: Range<usize>) {
        let end = range.end.min(self.messages.len());
        let start = range.start.min(end);
        self.messages.truncate(end);
        self.messages.drain(..start);
        self.reindex();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.orders.clear();
    }

    fn reindex(&mut self) {
        self.orders = self
            .messages
            .iter()
            .map(|m| (m.id.clone(), m.order))
            .collect();
    }

    fn search(&self, order: u64, id: &str) -> Result<usize, usize> {
        self.messages
            .binary_search_by(|m| (m.order, m.id.as_str()).cmp(&(order, id)))
    }
}

// ─── Trim planning ────────────────────────────────────────────────────────────

/// Range of a window of `len` messages that survives a trim to `target`.
///
/// `anchor` is the index of the read position (`None` = live edge).
/// `protected_from` is the first index of an in-flight turn; everything from
/// there to the tail is retained even if that exceeds `target`.
pub fn plan_trim(
    len: usize,
    anchor: Option<usize>,
    target: usize,
    protected_from: Option<usize>,
) -> Range<usize> {
    if len <= target {
        return 0..len;
    }
    let latest_start = len - target;
    if let Some(protected) = protected_from {
        return latest_start.min(protected)..len;
    }
    match anchor {
        None => latest_start..len,
        Some(at) => {
            let start = at.saturating_sub(target / 2).min(latest_start);
            start..start + target
        }
    }
}

// ─── Per-session state ────────────────────────────────────────────────────────

/// Where paging resumes when an evicted session is reopened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message_id", rename_all = "snake_case")]
pub enum ReloadPoint {
    /// Page ending right before this id; the reader was scrolled back and
    /// the anchor sits inside that page.
    Before(String),
    /// Page starting right after this id.
    After(String),
}

#[derive(Debug, Clone)]
pub struct SessionMemoryState {
    pub anchor: ViewportAnchor,
    pub last_accessed: Instant,
    /// Messages received while the session was not current.
    pub background_messages: usize,
    pub is_zombie: bool,
    pub has_more_above: bool,
    pub has_more_below: bool,
    /// The oldest message of the session is in (or was in) the window.
    pub history_complete: bool,
    /// Oldest retained id after a head trim; the re-fetch point.
    pub trimmed_head_max_id: Option<String>,
    /// Last id before the hole left by a tail trim; the `Down` cursor.
    /// Live arrivals may sit after the hole until a fetch fills it.
    pub trimmed_tail_id: Option<String>,
    /// Set by eviction when the reader was away from the live edge.
    pub reload: Option<ReloadPoint>,
    pub history_loading: Option<LoadDirection>,
    pub load_failed: bool,
    /// The window holds no authoritative latest page yet.
    pub needs_initial_load: bool,
}

impl SessionMemoryState {
    pub fn new(now: Instant) -> Self {
        Self {
            anchor: ViewportAnchor::LiveEdge,
            last_accessed: now,
            background_messages: 0,
            is_zombie: false,
            has_more_above: false,
            has_more_below: false,
            history_complete: false,
            trimmed_head_max_id: None,
            trimmed_tail_id: None,
            reload: None,
            history_loading: None,
            load_failed: false,
            needs_initial_load: true,
        }
    }
}

/// Window and bookkeeping of one buffered session.
#[derive(Debug)]
pub struct SessionBuffer {
    pub window: MessageWindow,
    pub state: SessionMemoryState,
}

impl SessionBuffer {
    pub fn new(now: Instant) -> Self {
        Self {
            window: MessageWindow::new(),
            state: SessionMemoryState::new(now),
        }
    }

    /// Index of the anchor message, `None` at the live edge.
    ///
    /// An anchor whose message is no longer buffered falls back to the live
    /// edge.
    pub fn anchor_index(&mut self) -> Option<usize> {
        let ViewportAnchor::Message(id) = &self.state.anchor else {
            return None;
        };
        let at = self.window.position(id);
        if at.is_none() {
            self.state.anchor = ViewportAnchor::LiveEdge;
        }
        at
    }

    pub fn trim(&mut self, target: usize, protected_from: Option<usize>) -> TrimReport {
        let len = self.window.len();
        let anchor = self.anchor_index();
        let keep = plan_trim(len, anchor, target, protected_from);
        let hole = self
            .state
            .trimmed_tail_id
            .as_deref()
            .and_then(|id| self.window.position(id));
        let report = TrimReport {
            removed_head: keep.start,
            removed_tail: len - keep.end,
            retained: keep.len(),
        };
        if report.removed() == 0 {
            return report;
        }
        self.window.retain_range(keep.clone());
        if report.removed_head > 0 {
            self.state.trimmed_head_max_id = self.window.first_id().map(str::to_string);
            self.state.has_more_above = true;
            self.state.history_complete = false;
        }
        match hole {
            // An older hole is still inside the window; its cursor stays.
            Some(at) if keep.contains(&at) => {}
            _ if report.removed_tail > 0 => {
                self.state.trimmed_tail_id = self.window.last_id().map(str::to_string);
                self.state.has_more_below = true;
            }
            // The hole moved above the window; the head marker covers it.
            Some(_) => {
                self.state.trimmed_tail_id = None;
                self.state.has_more_below = false;
            }
            None => {}
        }
        // Re-validate the anchor against the surviving range.
        self.anchor_index();
        report
    }

    /// Drop the content, keep the bookkeeping.  A reader scrolled back to a
    /// message gets a [`ReloadPoint`] so the reopened session pages in
    /// around that message instead of at the live edge.
    pub fn evict(&mut self, page_size: usize) {
        self.state.reload = self.reload_point(page_size);
        self.window.clear();
        self.state.background_messages = 0;
        self.state.needs_initial_load = true;
        self.state.is_zombie = false;
    }

    fn reload_point(&mut self, page_size: usize) -> Option<ReloadPoint> {
        let at = self.anchor_index()?;
        let messages = self.window.messages();
        let last = messages.len() - 1;
        if at < last {
            // Centre the anchor: the page ends half a page below it.
            let end = (at + (page_size / 2).max(1)).min(last);
            return Some(ReloadPoint::Before(messages[end].id.clone()));
        }
        if self.state.has_more_below && at > 0 {
            return Some(ReloadPoint::After(messages[at - 1].id.clone()));
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
