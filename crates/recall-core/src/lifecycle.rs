// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session streaming state: `streaming → cooldown → completed`, the last
//! backend status, and stuck detection.
use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use recall_model::{SessionId, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Streaming,
    /// Backend reported idle; trailing events are still being coalesced.
    Cooldown,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStreamLifecycle {
    pub message_id: String,
    pub phase: StreamPhase,
    pub started_at: Instant,
    pub last_update_at: Instant,
    pub completed_at: Option<Instant>,
    pub aborted: bool,
}

impl MessageStreamLifecycle {
    fn new(message_id: &str, now: Instant) -> Self {
        Self {
            message_id: message_id.to_string(),
            phase: StreamPhase::Streaming,
            started_at: now,
            last_update_at: now,
            completed_at: None,
            aborted: false,
        }
    }

    fn complete(&mut self, now: Instant) -> bool {
        if self.phase == StreamPhase::Completed {
            return false;
        }
        self.phase = StreamPhase::Completed;
        self.completed_at = Some(now);
        true
    }
}

/// What happened to an incoming assistant part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartDisposition {
    /// First part of a new assistant message.
    Started,
    /// More content for the tracked message.
    Continued,
    /// Part of an aborted message; must not be applied.
    Dropped,
}

#[derive(Debug)]
struct SessionStream {
    lifecycle: Option<MessageStreamLifecycle>,
    status: SessionStatus,
    last_activity: Instant,
    aborted_message: Option<String>,
}

impl SessionStream {
    fn new(now: Instant) -> Self {
        Self {
            lifecycle: None,
            status: SessionStatus::Idle,
            last_activity: now,
            aborted_message: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamTracker {
    sessions: HashMap<SessionId, SessionStream>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, session_id: &str, now: Instant) -> &mut SessionStream {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionStream::new(now))
    }

    /// Account for one assistant part of `message_id`.
    pub fn on_assistant_part(&mut self, session_id: &str, message_id: &str, now: Instant) -> PartDisposition {
        let stream = self.entry(session_id, now);
        if stream.aborted_message.as_deref() == Some(message_id) {
            debug!(session_id, message_id, "dropping part of aborted message");
            return PartDisposition::Dropped;
        }
        stream.last_activity = now;
        match &mut stream.lifecycle {
            Some(lc) if lc.message_id == message_id => {
                lc.last_update_at = now;
                PartDisposition::Continued
            }
            previous => {
                if let Some(old) = previous.as_ref() {
                    if old.phase != StreamPhase::Completed {
                        debug!(session_id, old = %old.message_id, new = message_id,
                            "new assistant message replaces unsettled stream");
                    }
                }
                *previous = Some(MessageStreamLifecycle::new(message_id, now));
                PartDisposition::Started
            }
        }
    }

    /// Record a backend status.  Returns `true` when the session entered
    /// cooldown.
    pub fn on_status(&mut self, session_id: &str, status: SessionStatus, now: Instant) -> bool {
        let stream = self.entry(session_id, now);
        stream.last_activity = now;
        let idle = !status.is_active();
        stream.status = status;
        match &mut stream.lifecycle {
            Some(lc) if idle && lc.phase == StreamPhase::Streaming => {
                lc.phase = StreamPhase::Cooldown;
                lc.last_update_at = now;
                true
            }
            _ => false,
        }
    }

    /// Move the tracked lifecycle to `completed`.  Returns the message id if
    /// it was not completed before.
    pub fn complete(&mut self, session_id: &str, now: Instant) -> Option<String> {
        let lc = self.sessions.get_mut(session_id)?.lifecycle.as_mut()?;
        lc.complete(now).then(|| lc.message_id.clone())
    }

    /// Apply a confirmed abort: complete the lifecycle, remember the message
    /// so later parts are dropped, and report the session idle.
    pub fn abort(&mut self, session_id: &str, now: Instant) -> Option<String> {
        let stream = self.entry(session_id, now);
        stream.status = SessionStatus::Idle;
        stream.last_activity = now;
        let lc = stream.lifecycle.as_mut()?;
        lc.aborted = true;
        lc.complete(now);
        stream.aborted_message = Some(lc.message_id.clone());
        Some(lc.message_id.clone())
    }

    /// Force a stuck session back to idle.
    pub fn reset_stuck(&mut self, session_id: &str, now: Instant) {
        let Some(stream) = self.sessions.get_mut(session_id) else {
            return;
        };
        warn!(
            session_id,
            status = ?stream.status,
            idle_for = ?now.duration_since(stream.last_activity),
            "session stuck, resetting to idle"
        );
        stream.status = SessionStatus::Idle;
        stream.last_activity = now;
        if let Some(lc) = &mut stream.lifecycle {
            lc.complete(now);
        }
    }

    /// Drop a completed lifecycle.  Returns `true` if one was removed.
    pub fn acknowledge_settled(&mut self, session_id: &str) -> bool {
        let Some(stream) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let settled = matches!(&stream.lifecycle, Some(lc) if lc.phase == StreamPhase::Completed);
        if settled {
            stream.lifecycle = None;
        }
        settled
    }

    pub fn lifecycle(&self, session_id: &str) -> Option<&MessageStreamLifecycle> {
        self.sessions.get(session_id)?.lifecycle.as_ref()
    }

    pub fn phase(&self, session_id: &str) -> Option<StreamPhase> {
        self.lifecycle(session_id).map(|lc| lc.phase)
    }

    /// Streaming and cooldown sessions must keep their tail and must not be
    /// evicted.
    pub fn is_pinned(&self, session_id: &str) -> bool {
        matches!(
            self.phase(session_id),
            Some(StreamPhase::Streaming | StreamPhase::Cooldown)
        )
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.phase(session_id) == Some(StreamPhase::Streaming)
    }

    /// Id of the in-flight assistant message, if any.
    pub fn active_message(&self, session_id: &str) -> Option<&str> {
        self.lifecycle(session_id)
            .filter(|lc| lc.phase != StreamPhase::Completed)
            .map(|lc| lc.message_id.as_str())
    }

    /// Id of the last aborted message; its late deliveries are discarded.
    pub fn aborted_message(&self, session_id: &str) -> Option<&str> {
        self.sessions.get(session_id)?.aborted_message.as_deref()
    }

    pub fn status(&self, session_id: &str) -> Option<&SessionStatus> {
        self.sessions.get(session_id).map(|s| &s.status)
    }

    pub fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.sessions.get(session_id).map(|s| s.last_activity)
    }

    pub fn remove(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn busy() -> SessionStatus {
        SessionStatus::Busy
    }

    #[test]
    fn first_part_starts_streaming() {
        let mut t = StreamTracker::new();
        let now = Instant::now();
        assert_eq!(t.on_assistant_part("s", "a1", now), PartDisposition::Started);
        assert_eq!(t.on_assistant_part("s", "a1", now), PartDisposition::Continued);
        assert!(t.is_streaming("s"));
        assert!(t.is_pinned("s"));
    }

    #[test]
    fn idle_while_streaming_enters_cooldown() {
        let mut t = StreamTracker::new();
        let now = Instant::now();
        t.on_status("s", busy(), now);
        t.on_assistant_part("s", "a1", now);
        assert!(t.on_status("s", SessionStatus::Idle, now));
        assert_eq!(t.phase("s"), Some(StreamPhase::Cooldown));
        assert!(t.is_pinned("s"), "cooldown still pins the session");
        // Second idle is not another transition.
        assert!(!t.on_status("s", SessionStatus::Idle, now));
    }

    #[test]
    fn part_during_cooldown_refreshes_without_restarting() {
        let mut t = StreamTracker::new();
        let t0 = Instant::now();
        t.on_assistant_part("s", "a1", t0);
        t.on_status("s", SessionStatus::Idle, t0);
        let t1 = t0 + Duration::from_millis(200);
        assert_eq!(t.on_assistant_part("s", "a1", t1), PartDisposition::Continued);
        let lc = t.lifecycle("s").unwrap();
        assert_eq!(lc.phase, StreamPhase::Cooldown);
        assert_eq!(lc.last_update_at, t1);
    }

    #[test]
    fn complete_then_acknowledge_drops_lifecycle() {
        let mut t = StreamTracker::new();
        let now = Instant::now();
        t.on_assistant_part("s", "a1", now);
        assert!(!t.acknowledge_settled("s"), "only completed lifecycles are dropped");
        assert_eq!(t.complete("s", now).as_deref(), Some("a1"));
        assert_eq!(t.complete("s", now), None);
        assert!(!t.is_pinned("s"));
        assert!(t.acknowledge_settled("s"));
        assert!(t.lifecycle("s").is_none());
    }

    #[test]
    fn new_message_id_replaces_lifecycle() {
        let mut t = StreamTracker::new();
        let now = Instant::now();
        t.on_assistant_part("s", "a1", now);
        t.complete("s", now);
        assert_eq!(t.on_assistant_part("s", "a2", now), PartDisposition::Started);
        assert_eq!(t.active_message("s"), Some("a2"));
    }

    #[test]
    fn aborted_message_parts_are_dropped() {
        let mut t = StreamTracker::new();
        let now = Instant::now();
        t.on_status("s", busy(), now);
        t.on_assistant_part("s", "a1", now);
        assert_eq!(t.abort("s", now).as_deref(), Some("a1"));
        assert_eq!(t.on_assistant_part("s", "a1", now), PartDisposition::Dropped);
        assert_eq!(t.status("s"), Some(&SessionStatus::Idle));
        let lc = t.lifecycle("s").unwrap();
        assert!(lc.aborted);
        assert_eq!(lc.phase, StreamPhase::Completed);
        // The next turn streams normally.
        assert_eq!(t.on_assistant_part("s", "a2", now), PartDisposition::Started);
    }

    #[test]
    fn stuck_detection_and_reset() {
        let mut t = StreamTracker::new();
        let t0 = Instant::now();
        t.on_status("s", busy(), t0);
        t.on_assistant_part("s", "a1", t0);
        t.on_status("quiet", SessionStatus::Idle, t0);
        assert_eq!(t.last_activity("s"), Some(t0));
        let later = t0 + Duration::from_secs(300);
        t.reset_stuck("s", later);
        assert_eq!(t.status("s"), Some(&SessionStatus::Idle));
        assert_eq!(t.phase("s"), Some(StreamPhase::Completed));
        assert_eq!(t.last_activity("s"), Some(later));
        // Resetting an unknown session is a no-op.
        t.reset_stuck("gone", later);
        assert_eq!(t.status("gone"), None);
        assert_eq!(t.status("quiet"), Some(&SessionStatus::Idle));
    }
}
