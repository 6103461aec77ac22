// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Abort flags, the global two-press abort prompt, and pause snapshots.
//!
//! Every remote operation is two-phase: `begin_*` / `request_abort` sets an
//! in-flight guard, the caller performs the remote call, then exactly one of
//! the `finish_*` / `confirm_*` or `cancel_*` / `fail_*` methods is applied.
//! Local state only changes on success.
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use recall_model::{PauseSnapshot, SessionId};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortFlag {
    pub requested_at: Instant,
    pub executed: bool,
    /// The renderer has shown the "aborted" marker.
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortPrompt {
    pub session_id: SessionId,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AbortDecision {
    /// First press: the confirmation prompt is armed.
    Armed {
        #[serde(skip)]
        expires_at: Instant,
    },
    /// Confirmed press: the remote abort must be issued now.
    Fire,
    /// An abort for this session is already running.
    InFlight,
}

#[derive(Debug)]
pub struct AbortCoordinator {
    prompt: Option<AbortPrompt>,
    prompt_duration: Duration,
    /// session → instant the abort was fired.
    aborts_in_flight: HashMap<SessionId, Instant>,
    flags: HashMap<SessionId, AbortFlag>,
    paused: HashMap<SessionId, PauseSnapshot>,
    pause_in_flight: HashSet<SessionId>,
}

impl AbortCoordinator {
    pub fn new(prompt_duration: Duration) -> Self {
        Self {
            prompt: None,
            prompt_duration,
            aborts_in_flight: HashMap::new(),
            flags: HashMap::new(),
            paused: HashMap::new(),
            pause_in_flight: HashSet::new(),
        }
    }

    // ── Abort ────────────────────────────────────────────────────────────────

    /// Arm the confirmation prompt for `session_id`, replacing any other.
    pub fn arm_abort_prompt(&mut self, session_id: &str, duration: Option<Duration>, now: Instant) -> Instant {
        let expires_at = now + duration.unwrap_or(self.prompt_duration);
        self.prompt = Some(AbortPrompt {
            session_id: session_id.to_string(),
            expires_at,
        });
        debug!(session_id, "abort prompt armed");
        expires_at
    }

    pub fn request_abort(&mut self, session_id: &str, now: Instant) -> AbortDecision {
        if self.aborts_in_flight.contains_key(session_id) {
            return AbortDecision::InFlight;
        }
        match &self.prompt {
            Some(p) if p.session_id == session_id && now < p.expires_at => {
                self.aborts_in_flight.insert(session_id.to_string(), now);
                AbortDecision::Fire
            }
            _ => AbortDecision::Armed {
                expires_at: self.arm_abort_prompt(session_id, None, now),
            },
        }
    }

    /// The remote abort succeeded.
    ///
    /// Returns `false` when no abort was in flight for the session, e.g. it
    /// was removed while the request was outstanding.
    pub fn confirm_abort(&mut self, session_id: &str) -> bool {
        let Some(requested_at) = self.aborts_in_flight.remove(session_id) else {
            return false;
        };
        self.flags.insert(
            session_id.to_string(),
            AbortFlag {
                requested_at,
                executed: true,
                acknowledged: false,
            },
        );
        if self.prompt.as_ref().is_some_and(|p| p.session_id == session_id) {
            self.prompt = None;
        }
        true
    }

    /// The remote abort failed; only the in-flight guard is released.
    pub fn fail_abort(&mut self, session_id: &str) {
        self.aborts_in_flight.remove(session_id);
    }

    /// Clear the pending-display bit.  Returns `false` if there was nothing
    /// to acknowledge.
    pub fn acknowledge_session_abort(&mut self, session_id: &str) -> bool {
        match self.flags.get_mut(session_id) {
            Some(flag) if !flag.acknowledged => {
                flag.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the prompt if it has expired.  Returns the session it was bound to.
    pub fn expire_prompt(&mut self, now: Instant) -> Option<SessionId> {
        match &self.prompt {
            Some(p) if now >= p.expires_at => self.prompt.take().map(|p| p.session_id),
            _ => None,
        }
    }

    pub fn prompt(&self) -> Option<&AbortPrompt> {
        self.prompt.as_ref()
    }

    pub fn abort_flag(&self, session_id: &str) -> Option<&AbortFlag> {
        self.flags.get(session_id)
    }

    pub fn abort_in_flight(&self, session_id: &str) -> bool {
        self.aborts_in_flight.contains_key(session_id)
    }

    // ── Pause ────────────────────────────────────────────────────────────────

    pub fn begin_pause(&mut self, session_id: &str) -> Result<()> {
        if self.paused.contains_key(session_id) {
            return Err(MemoryError::AlreadyPaused(session_id.to_string()));
        }
        self.guard_pause(session_id)
    }

    /// Record a completed pause.  Ignored unless the pause is still in
    /// flight.
    pub fn finish_pause(&mut self, snapshot: PauseSnapshot) -> bool {
        if !self.pause_in_flight.remove(&snapshot.session_id) {
            return false;
        }
        self.paused.insert(snapshot.session_id.clone(), snapshot);
        true
    }

    /// Start a resume or unpause.  Returns the snapshot to hand to the
    /// backend.
    pub fn begin_release(&mut self, session_id: &str) -> Result<PauseSnapshot> {
        let snapshot = self
            .paused
            .get(session_id)
            .cloned()
            .ok_or_else(|| MemoryError::NotPaused(session_id.to_string()))?;
        self.guard_pause(session_id)?;
        Ok(snapshot)
    }

    /// A resume or unpause succeeded remotely.
    pub fn finish_release(&mut self, session_id: &str) -> Option<PauseSnapshot> {
        if !self.pause_in_flight.remove(session_id) {
            return None;
        }
        self.paused.remove(session_id)
    }

    /// A pause, resume or unpause failed remotely.
    pub fn cancel_pause_op(&mut self, session_id: &str) {
        self.pause_in_flight.remove(session_id);
    }

    pub fn paused(&self, session_id: &str) -> Option<&PauseSnapshot> {
        self.paused.get(session_id)
    }

    pub fn paused_count(&self) -> usize {
        self.paused.len()
    }

    fn guard_pause(&mut self, session_id: &str) -> Result<()> {
        if !self.pause_in_flight.insert(session_id.to_string()) {
            return Err(MemoryError::PauseInFlight(session_id.to_string()));
        }
        Ok(())
    }

    /// Forget everything about a deleted session.
    pub fn remove_session(&mut self, session_id: &str) {
        self.aborts_in_flight.remove(session_id);
        self.flags.remove(session_id);
        self.paused.remove(session_id);
        self.pause_in_flight.remove(session_id);
        if self.prompt.as_ref().is_some_and(|p| p.session_id == session_id) {
            self.prompt = None;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recall_model::ModelSelection;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn snapshot(id: &str) -> PauseSnapshot {
        PauseSnapshot {
            session_id: id.into(),
            paused_at: Utc::now(),
            last_user_message_id: None,
            last_user_text: None,
            selection: ModelSelection::default(),
            context_summary: String::new(),
        }
    }

    // ── Abort prompt ─────────────────────────────────────────────────────────

    #[test]
    fn second_press_within_window_fires_once() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        c.arm_abort_prompt("s", Some(ms(5000)), t0);
        assert_eq!(c.request_abort("s", t0 + ms(4999)), AbortDecision::Fire);
        assert_eq!(c.request_abort("s", t0 + ms(4999)), AbortDecision::InFlight);
        assert!(c.confirm_abort("s"));
        assert!(c.prompt().is_none());
        assert!(matches!(c.request_abort("s", t0 + ms(6000)), AbortDecision::Armed { .. }));
    }

    #[test]
    fn press_after_expiry_rearms() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        c.arm_abort_prompt("s", Some(ms(5000)), t0);
        let decision = c.request_abort("s", t0 + ms(5000));
        assert_eq!(decision, AbortDecision::Armed { expires_at: t0 + ms(8000) });
        assert!(!c.abort_in_flight("s"));
    }

    #[test]
    fn prompt_is_bound_to_its_session() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        c.arm_abort_prompt("a", None, t0);
        assert!(matches!(c.request_abort("b", t0 + ms(10)), AbortDecision::Armed { .. }));
        assert_eq!(c.prompt().unwrap().session_id, "b");
    }

    #[test]
    fn failed_abort_only_releases_guard() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        c.arm_abort_prompt("s", None, t0);
        assert_eq!(c.request_abort("s", t0 + ms(1)), AbortDecision::Fire);
        c.fail_abort("s");
        assert!(c.abort_flag("s").is_none());
        assert!(c.prompt().is_some());
        assert_eq!(c.request_abort("s", t0 + ms(2)), AbortDecision::Fire);
    }

    #[test]
    fn acknowledge_clears_display_bit_only() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        assert!(!c.acknowledge_session_abort("s"));
        c.arm_abort_prompt("s", None, t0);
        c.request_abort("s", t0);
        assert!(c.confirm_abort("s"));
        assert!(c.acknowledge_session_abort("s"));
        let flag = c.abort_flag("s").unwrap();
        assert!(flag.executed && flag.acknowledged);
        assert!(!c.acknowledge_session_abort("s"));
    }

    #[test]
    fn expire_prompt_only_after_deadline() {
        let mut c = AbortCoordinator::new(ms(100));
        let t0 = Instant::now();
        c.arm_abort_prompt("s", None, t0);
        assert_eq!(c.expire_prompt(t0 + ms(99)), None);
        assert_eq!(c.expire_prompt(t0 + ms(100)).as_deref(), Some("s"));
        assert!(c.prompt().is_none());
    }

    // ── Pause ────────────────────────────────────────────────────────────────

    #[test]
    fn pause_lifecycle() {
        let mut c = AbortCoordinator::new(ms(3000));
        assert_eq!(c.begin_release("s"), Err(MemoryError::NotPaused("s".into())));
        c.begin_pause("s").unwrap();
        assert_eq!(c.begin_pause("s"), Err(MemoryError::PauseInFlight("s".into())));
        assert!(c.finish_pause(snapshot("s")));
        assert_eq!(c.begin_pause("s"), Err(MemoryError::AlreadyPaused("s".into())));
        let snap = c.begin_release("s").unwrap();
        assert_eq!(snap.session_id, "s");
        assert!(c.finish_release("s").is_some());
        assert!(c.paused("s").is_none());
    }

    #[test]
    fn failed_release_keeps_snapshot() {
        let mut c = AbortCoordinator::new(ms(3000));
        c.begin_pause("s").unwrap();
        c.finish_pause(snapshot("s"));
        c.begin_release("s").unwrap();
        c.cancel_pause_op("s");
        assert!(c.paused("s").is_some());
        assert!(c.begin_release("s").is_ok());
    }

    // ── Removal ──────────────────────────────────────────────────────────────

    #[test]
    fn completions_after_removal_are_ignored() {
        let mut c = AbortCoordinator::new(ms(3000));
        let t0 = Instant::now();
        c.begin_pause("s").unwrap();
        c.arm_abort_prompt("s", None, t0);
        assert_eq!(c.request_abort("s", t0 + ms(1)), AbortDecision::Fire);
        c.remove_session("s");

        assert!(!c.finish_pause(snapshot("s")));
        assert!(!c.confirm_abort("s"));
        assert!(c.paused("s").is_none());
        assert_eq!(c.paused_count(), 0);
        assert!(c.abort_flag("s").is_none());
    }

    #[test]
    fn release_completion_without_begin_is_ignored() {
        let mut c = AbortCoordinator::new(ms(3000));
        c.begin_pause("s").unwrap();
        assert!(c.finish_pause(snapshot("s")));
        assert!(c.finish_release("s").is_none());
        assert!(c.paused("s").is_some());
    }
}
