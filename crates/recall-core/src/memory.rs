// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `SessionMemory` is the single owner of every session window, stream
//! lifecycle, eviction record, abort/pause record and timer.
//!
//! The controller is synchronous and never blocks: time is passed in
//! explicitly and remote work is split into a `begin` step that returns what
//! to ask the backend for and a `complete` / `fail` step that applies the
//! answer.  [`crate::service::MemoryService`] drives it from one task.
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use recall_config::{Config, MemoryConfig};
use recall_model::{
    HistoryPage, HistoryQuery, MessageRecord, ModelSelection, Part, PauseSnapshot, Role, Session,
    SessionId, SessionPatch, SessionStatus, TransportEvent,
};

use crate::abort::{AbortCoordinator, AbortDecision, AbortFlag, AbortPrompt};
use crate::error::{MemoryError, Result};
use crate::eviction::EvictionPolicy;
use crate::lifecycle::{MessageStreamLifecycle, PartDisposition, StreamPhase, StreamTracker};
use crate::registry::{MetadataOutcome, SessionRegistry};
use crate::timers::{Scheduler, TimerKind};
use crate::window::{
    LoadDirection, MergeStats, MessageWindow, ReloadPoint, SessionBuffer, SessionMemoryState,
    TrimReport, ViewportAnchor,
};

/// Change notification for the renderer.  Carries ids only; the renderer
/// pulls a [`SessionView`] for the details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum MemoryNotice {
    WindowChanged { session_id: SessionId },
    SessionsChanged { session_id: SessionId },
    SessionEvicted { session_id: SessionId },
    StreamSettled { session_id: SessionId, message_id: String },
    StuckReset { session_id: SessionId },
    AbortPromptArmed { session_id: SessionId },
    AbortPromptExpired { session_id: SessionId },
    Aborted { session_id: SessionId, message_id: Option<String> },
    LoadFailed { session_id: SessionId, error: String },
    Paused { session_id: SessionId },
    Resumed { session_id: SessionId },
    Unpaused { session_id: SessionId },
}

/// Read-only snapshot of one session for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub messages: Vec<MessageRecord>,
    pub anchor: ViewportAnchor,
    pub has_more_above: bool,
    pub has_more_below: bool,
    pub is_streaming: bool,
    pub history_loading: Option<LoadDirection>,
    pub load_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub sessions: usize,
    pub hot_sessions: usize,
    pub zombies: usize,
    pub buffered_messages: usize,
    pub paused: usize,
    pub pending_timers: usize,
}

pub struct SessionMemory {
    config: MemoryConfig,
    page_size: usize,
    registry: SessionRegistry,
    buffers: HashMap<SessionId, SessionBuffer>,
    streams: StreamTracker,
    eviction: EvictionPolicy,
    aborts: AbortCoordinator,
    scheduler: Scheduler,
    notices: Vec<MemoryNotice>,
}

impl SessionMemory {
    pub fn new(config: &Config, now: Instant) -> Self {
        let memory = config.memory.clone();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(None, TimerKind::ZombieSweep, now + memory.zombie_sweep_interval());
        Self {
            eviction: EvictionPolicy::new(memory.max_sessions, memory.zombie_timeout()),
            aborts: AbortCoordinator::new(memory.abort_prompt()),
            page_size: config.history.page_size,
            registry: SessionRegistry::new(),
            buffers: HashMap::new(),
            streams: StreamTracker::new(),
            scheduler,
            notices: Vec::new(),
            config: memory,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ── Registry ─────────────────────────────────────────────────────────────

    pub fn upsert_session(&mut self, session: Session) -> bool {
        let session_id = session.id.clone();
        let created = self.registry.upsert_session(session);
        self.notices.push(MemoryNotice::SessionsChanged { session_id });
        created
    }

    pub fn apply_session_metadata(&mut self, patch: &SessionPatch) -> MetadataOutcome {
        let outcome = self.registry.apply_session_metadata(patch);
        if matches!(outcome, MetadataOutcome::Created | MetadataOutcome::Updated) {
            self.notices.push(MemoryNotice::SessionsChanged {
                session_id: patch.id.clone(),
            });
        }
        outcome
    }

    pub fn update_session(&mut self, session_id: &str, patch: &SessionPatch) -> Result<bool> {
        let changed = self.registry.update_session(session_id, patch)?;
        if changed {
            self.notices.push(MemoryNotice::SessionsChanged {
                session_id: session_id.to_string(),
            });
        }
        Ok(changed)
    }

    /// Forget a deleted session entirely, cancelling all of its timers.
    pub fn remove_session(&mut self, session_id: &str) -> Result<Session> {
        let session = self
            .registry
            .remove_session(session_id)
            .ok_or_else(|| MemoryError::UnknownSession(session_id.to_string()))?;
        self.buffers.remove(session_id);
        self.streams.remove(session_id);
        self.eviction.remove(session_id);
        self.aborts.remove_session(session_id);
        let cancelled = self.scheduler.cancel_session(session_id);
        info!(session_id, cancelled, "session removed");
        self.notices.push(MemoryNotice::SessionsChanged {
            session_id: session_id.to_string(),
        });
        Ok(session)
    }

    pub fn get_sessions_by_directory(&self, directory: &Path) -> Vec<Session> {
        self.registry.get_sessions_by_directory(directory)
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.registry.get(session_id)
    }

    pub fn current_session(&self) -> Option<&str> {
        self.registry.current()
    }

    /// Make `session_id` current.  Returns the initial history query when
    /// the session has not been loaded yet.
    pub fn set_current_session(&mut self, session_id: &str, now: Instant) -> Result<Option<HistoryQuery>> {
        let previous = self.registry.set_current(session_id)?;
        if let Some(prev) = previous.filter(|p| p != session_id) {
            debug!(session_id = %prev, "session moved to background");
            if let Some(buffer) = self.buffers.get_mut(&prev) {
                buffer.state.background_messages = 0;
                if buffer.window.len() > self.config.background_trim_target() {
                    self.scheduler.schedule(
                        Some(&prev),
                        TimerKind::BackgroundTrim,
                        now + self.config.trim_debounce(),
                    );
                }
            }
        }

        self.scheduler.cancel_for(Some(session_id), TimerKind::BackgroundTrim);
        self.buffer_mut(session_id, now).state.background_messages = 0;
        self.touch(session_id, now);
        if self.window_len(session_id) > self.config.message_limit {
            self.trim_buffer(session_id, self.config.message_limit);
        }
        self.enforce_capacity();
        Ok(self.initial_load_query(session_id))
    }

    // ── Transport ────────────────────────────────────────────────────────────

    pub fn apply_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::MessagePart {
                session_id,
                message_id,
                role,
                order,
                part,
            } => {
                self.add_streaming_part(&session_id, &message_id, role, order, part, now);
            }
            TransportEvent::MessageUpdated { session_id, message } => {
                self.sync_messages(&session_id, vec![message], now);
            }
            TransportEvent::StatusChange { session_id, status } => {
                self.set_status(&session_id, status, now);
            }
            TransportEvent::SessionUpdated { session } => {
                self.apply_session_metadata(&session);
            }
        }
    }

    /// Merge a batch of records into the session window.
    pub fn sync_messages(&mut self, session_id: &str, messages: Vec<MessageRecord>, now: Instant) -> MergeStats {
        let aborted = self.streams.aborted_message(session_id).map(str::to_string);
        let batch = messages.into_iter().filter(|m| {
            let drop = aborted.as_deref() == Some(m.id.as_str());
            if drop {
                debug!(session_id, message_id = %m.id, "dropping update of aborted message");
            }
            !drop
        });
        let stats = self.buffer_mut(session_id, now).window.merge(batch);
        trace!(session_id, inserted = stats.inserted, updated = stats.updated, "messages synced");
        self.after_write(session_id, stats, now);
        stats
    }

    /// Apply one streamed part.  Returns `false` if the part was dropped.
    pub fn add_streaming_part(
        &mut self,
        session_id: &str,
        message_id: &str,
        role: Role,
        order: u64,
        part: Part,
        now: Instant,
    ) -> bool {
        if role == Role::Assistant {
            match self.streams.on_assistant_part(session_id, message_id, now) {
                PartDisposition::Dropped => return false,
                PartDisposition::Started => debug!(session_id, message_id, "stream started"),
                PartDisposition::Continued => {}
            }
            if self.streams.phase(session_id) == Some(StreamPhase::Cooldown) {
                // Trailing events push the settle point out.
                self.scheduler.schedule(
                    Some(session_id),
                    TimerKind::Cooldown,
                    now + self.config.cooldown(),
                );
            }
            if self.streams.status(session_id).is_some_and(SessionStatus::is_active) {
                self.scheduler.schedule(
                    Some(session_id),
                    TimerKind::StuckCheck,
                    now + self.config.stuck_timeout(),
                );
            }
        }
        let stats = self
            .buffer_mut(session_id, now)
            .window
            .upsert_part(message_id, role, order, part);
        self.after_write(session_id, stats, now);
        true
    }

    pub fn set_status(&mut self, session_id: &str, status: SessionStatus, now: Instant) {
        let active = status.is_active();
        if self.streams.on_status(session_id, status, now) {
            debug!(session_id, "stream cooling down");
            self.scheduler.schedule(
                Some(session_id),
                TimerKind::Cooldown,
                now + self.config.cooldown(),
            );
        }
        if active {
            self.scheduler.schedule(
                Some(session_id),
                TimerKind::StuckCheck,
                now + self.config.stuck_timeout(),
            );
        } else {
            self.scheduler.cancel_for(Some(session_id), TimerKind::StuckCheck);
        }
    }

    /// Finish the tracked stream now instead of waiting for the cooldown.
    pub fn mark_message_stream_settled(&mut self, session_id: &str, now: Instant) -> bool {
        self.scheduler.cancel_for(Some(session_id), TimerKind::Cooldown);
        let Some(message_id) = self.streams.complete(session_id, now) else {
            return false;
        };
        debug!(session_id, %message_id, "stream settled");
        self.notices.push(MemoryNotice::StreamSettled {
            session_id: session_id.to_string(),
            message_id,
        });
        self.after_settle(session_id, now);
        true
    }

    /// Drop the settled lifecycle once the renderer has caught up.
    pub fn acknowledge_settled(&mut self, session_id: &str) -> bool {
        self.streams.acknowledge_settled(session_id)
    }

    // ── History & viewport ───────────────────────────────────────────────────

    /// Build the next history query for `direction`, or `None` when a fetch
    /// is already in flight or there is nothing more to load.
    pub fn load_more_messages(
        &mut self,
        session_id: &str,
        direction: LoadDirection,
        now: Instant,
    ) -> Result<Option<HistoryQuery>> {
        self.ensure_known(session_id)?;
        self.buffer_mut(session_id, now);
        self.touch(session_id, now);
        self.enforce_capacity();

        let page_size = self.page_size;
        let Some(buffer) = self.buffers.get_mut(session_id) else {
            return Ok(None);
        };
        if buffer.state.history_loading.is_some() {
            debug!(session_id, "history fetch already in flight");
            return Ok(None);
        }
        if buffer.state.needs_initial_load {
            return Ok(self.initial_load_query(session_id));
        }

        let latest = HistoryQuery::latest(session_id, page_size);
        let query = match direction {
            LoadDirection::Up => {
                if !buffer.state.has_more_above {
                    return Ok(None);
                }
                let before = buffer
                    .state
                    .trimmed_head_max_id
                    .clone()
                    .or_else(|| buffer.window.first_id().map(str::to_string));
                HistoryQuery { before, ..latest }
            }
            LoadDirection::Down => {
                if !buffer.state.has_more_below {
                    return Ok(None);
                }
                let after = buffer
                    .state
                    .trimmed_tail_id
                    .clone()
                    .or_else(|| buffer.window.last_id().map(str::to_string));
                HistoryQuery { after, ..latest }
            }
        };
        buffer.state.history_loading = Some(direction);
        buffer.state.load_failed = false;
        Ok(Some(query))
    }

    /// Apply the outcome of a history fetch issued for `direction`.
    pub fn apply_history_page(
        &mut self,
        session_id: &str,
        direction: LoadDirection,
        result: std::result::Result<HistoryPage, String>,
        now: Instant,
    ) {
        let Some(buffer) = self.buffers.get_mut(session_id) else {
            debug!(session_id, "history page for unknown session dropped");
            return;
        };
        buffer.state.history_loading = None;

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                warn!(session_id, %error, "history fetch failed");
                buffer.state.load_failed = true;
                self.notices.push(MemoryNotice::LoadFailed {
                    session_id: session_id.to_string(),
                    error,
                });
                return;
            }
        };
        if !self.eviction.is_hot(session_id) {
            debug!(session_id, "session evicted while loading, page dropped");
            return;
        }

        buffer.state.load_failed = false;
        let initial = buffer.state.needs_initial_load;
        let (page_first, page_last) = page_bounds(&page.messages);
        let stats = buffer.window.merge(page.messages);
        let state = &mut buffer.state;
        if initial {
            state.needs_initial_load = false;
            state.has_more_above = page.has_more_before;
            state.history_complete = !page.has_more_before;
            match state.reload.take() {
                None => {
                    state.has_more_below = false;
                    state.trimmed_tail_id = None;
                    state.trimmed_head_max_id = None;
                }
                Some(reload) => {
                    // The head marker survives only if the page starts at it.
                    if state.trimmed_head_max_id != page_first {
                        state.trimmed_head_max_id = None;
                    }
                    let more_below = match reload {
                        ReloadPoint::Before(_) => true,
                        ReloadPoint::After(_) => page.has_more_after,
                    };
                    state.has_more_below = more_below;
                    state.trimmed_tail_id = if more_below { page_last } else { None };
                }
            }
        } else {
            match direction {
                LoadDirection::Up => {
                    state.has_more_above = page.has_more_before;
                    state.history_complete = !page.has_more_before;
                    state.trimmed_head_max_id = None;
                }
                LoadDirection::Down => {
                    state.has_more_below = page.has_more_after;
                    state.trimmed_tail_id = if page.has_more_after {
                        page_last.or_else(|| state.trimmed_tail_id.take())
                    } else {
                        None
                    };
                }
            }
        }
        debug!(session_id, ?direction, initial, inserted = stats.inserted, "history page applied");
        self.after_write(session_id, stats, now);
    }

    /// Record the read position.  Returns a load hint when the anchor
    /// reached the oldest retained message (older history exists) or came
    /// back to the live edge of a tail-trimmed window.
    pub fn update_viewport_anchor(
        &mut self,
        session_id: &str,
        anchor: ViewportAnchor,
        now: Instant,
    ) -> Result<Option<LoadDirection>> {
        let buffer = self
            .buffers
            .get_mut(session_id)
            .ok_or_else(|| MemoryError::UnknownSession(session_id.to_string()))?;
        let hint = match &anchor {
            ViewportAnchor::Message(message_id) => {
                let at = buffer
                    .window
                    .position(message_id)
                    .ok_or_else(|| MemoryError::UnknownMessage {
                        session_id: session_id.to_string(),
                        message_id: message_id.clone(),
                    })?;
                if at == 0 && buffer.state.has_more_above {
                    if buffer.state.trimmed_head_max_id.take().is_some() {
                        debug!(session_id, "scrolled to trim point, marker invalidated");
                    }
                    Some(LoadDirection::Up)
                } else {
                    None
                }
            }
            ViewportAnchor::LiveEdge => buffer.state.has_more_below.then_some(LoadDirection::Down),
        };
        buffer.state.anchor = anchor;
        self.touch(session_id, now);
        Ok(hint)
    }

    /// Trim the window to `target` (default `message_limit`) around the
    /// anchor.  The in-flight turn is never dropped.
    pub fn trim_to_viewport_window(&mut self, session_id: &str, target: Option<usize>) -> Result<TrimReport> {
        if !self.buffers.contains_key(session_id) {
            return Err(MemoryError::UnknownSession(session_id.to_string()));
        }
        Ok(self.trim_buffer(session_id, target.unwrap_or(self.config.message_limit)))
    }

    // ── Abort ────────────────────────────────────────────────────────────────

    pub fn arm_abort_prompt(&mut self, session_id: &str, duration: Option<Duration>, now: Instant) -> Result<Instant> {
        self.ensure_known(session_id)?;
        let expires_at = self.aborts.arm_abort_prompt(session_id, duration, now);
        self.prompt_armed(session_id, expires_at);
        Ok(expires_at)
    }

    /// One press of the abort key.  [`AbortDecision::Fire`] means the caller
    /// must now issue the remote abort and report back with
    /// [`Self::confirm_abort`] or [`Self::fail_abort`].
    pub fn request_abort(&mut self, session_id: &str, now: Instant) -> Result<AbortDecision> {
        self.ensure_known(session_id)?;
        let decision = self.aborts.request_abort(session_id, now);
        match decision {
            AbortDecision::Armed { expires_at } => self.prompt_armed(session_id, expires_at),
            AbortDecision::Fire => info!(session_id, "abort confirmed, firing"),
            AbortDecision::InFlight => debug!(session_id, "abort already in flight"),
        }
        Ok(decision)
    }

    fn prompt_armed(&mut self, session_id: &str, expires_at: Instant) {
        self.scheduler.schedule(None, TimerKind::AbortPromptExpiry, expires_at);
        self.notices.push(MemoryNotice::AbortPromptArmed {
            session_id: session_id.to_string(),
        });
    }

    /// The backend accepted the abort: settle the stream locally.
    pub fn confirm_abort(&mut self, session_id: &str, now: Instant) {
        if !self.aborts.confirm_abort(session_id) {
            debug!(session_id, "abort completion without a pending abort dropped");
            return;
        }
        if self.aborts.prompt().is_none() {
            self.scheduler.cancel_for(None, TimerKind::AbortPromptExpiry);
        }
        let message_id = self.streams.abort(session_id, now);
        self.scheduler.cancel_for(Some(session_id), TimerKind::Cooldown);
        self.scheduler.cancel_for(Some(session_id), TimerKind::StuckCheck);
        info!(session_id, message_id = ?message_id, "turn aborted");
        self.notices.push(MemoryNotice::Aborted {
            session_id: session_id.to_string(),
            message_id,
        });
        self.after_settle(session_id, now);
    }

    pub fn fail_abort(&mut self, session_id: &str, error: &str) {
        warn!(session_id, error, "abort failed");
        self.aborts.fail_abort(session_id);
    }

    pub fn acknowledge_session_abort(&mut self, session_id: &str) -> bool {
        self.aborts.acknowledge_session_abort(session_id)
    }

    // ── Pause ────────────────────────────────────────────────────────────────

    /// Build the pause snapshot and mark the pause in flight.  The caller
    /// persists it remotely, then calls [`Self::complete_pause`] or
    /// [`Self::cancel_pause_op`].
    pub fn pause_session(&mut self, session_id: &str, selection: ModelSelection) -> Result<PauseSnapshot> {
        self.ensure_known(session_id)?;
        self.aborts.begin_pause(session_id)?;
        Ok(self.snapshot(session_id, selection))
    }

    pub fn complete_pause(&mut self, snapshot: PauseSnapshot) {
        let session_id = snapshot.session_id.clone();
        if !self.aborts.finish_pause(snapshot) {
            debug!(session_id = %session_id, "pause completion without a pending pause dropped");
            return;
        }
        info!(session_id = %session_id, "session paused");
        self.notices.push(MemoryNotice::Paused { session_id });
    }

    /// Start a resume.  Works whether or not the session is hot.
    pub fn resume_session(&mut self, session_id: &str) -> Result<PauseSnapshot> {
        self.aborts.begin_release(session_id)
    }

    pub fn complete_resume(&mut self, session_id: &str) -> Option<PauseSnapshot> {
        let Some(snapshot) = self.aborts.finish_release(session_id) else {
            debug!(session_id, "resume completion without a pending resume dropped");
            return None;
        };
        info!(session_id, "session resumed");
        self.notices.push(MemoryNotice::Resumed {
            session_id: session_id.to_string(),
        });
        Some(snapshot)
    }

    /// Start discarding a pause without resuming.
    pub fn unpause_session(&mut self, session_id: &str) -> Result<PauseSnapshot> {
        self.aborts.begin_release(session_id)
    }

    pub fn complete_unpause(&mut self, session_id: &str) -> Option<PauseSnapshot> {
        let Some(snapshot) = self.aborts.finish_release(session_id) else {
            debug!(session_id, "unpause completion without a pending unpause dropped");
            return None;
        };
        info!(session_id, "pause discarded");
        self.notices.push(MemoryNotice::Unpaused {
            session_id: session_id.to_string(),
        });
        Some(snapshot)
    }

    /// A pause, resume or unpause failed remotely; local state is untouched.
    pub fn cancel_pause_op(&mut self, session_id: &str, error: &str) {
        warn!(session_id, error, "pause operation failed");
        self.aborts.cancel_pause_op(session_id);
    }

    fn snapshot(&self, session_id: &str, selection: ModelSelection) -> PauseSnapshot {
        let messages = self
            .buffers
            .get(session_id)
            .map(|b| b.window.messages())
            .unwrap_or_default();
        let last_user = messages.iter().rev().find(|m| m.role == Role::User);
        let tail = &messages[messages.len().saturating_sub(self.config.summary_messages)..];
        let context_summary = tail
            .iter()
            .map(|m| format!("{}: {}", m.role, truncate_chars(&m.text(), self.config.summary_chars)))
            .collect::<Vec<_>>()
            .join("\n");
        PauseSnapshot {
            session_id: session_id.to_string(),
            paused_at: Utc::now(),
            last_user_message_id: last_user.map(|m| m.id.clone()),
            last_user_text: last_user.map(MessageRecord::text),
            selection,
            context_summary,
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Run every timer due at `now`.  Returns how many fired.
    pub fn fire_due_timers(&mut self, now: Instant) -> usize {
        let due = self.scheduler.pop_due(now);
        let fired = due.len();
        for task in due {
            trace!(kind = ?task.kind, session_id = ?task.session_id, "timer fired");
            match (task.kind, task.session_id) {
                (TimerKind::ZombieSweep, _) => self.sweep_zombies(now),
                (TimerKind::AbortPromptExpiry, _) => {
                    if let Some(session_id) = self.aborts.expire_prompt(now) {
                        debug!(session_id = %session_id, "abort prompt expired");
                        self.notices.push(MemoryNotice::AbortPromptExpired { session_id });
                    }
                }
                (TimerKind::Cooldown, Some(session_id)) => {
                    if self.streams.phase(&session_id) == Some(StreamPhase::Cooldown) {
                        self.mark_message_stream_settled(&session_id, now);
                    }
                }
                (TimerKind::BackgroundTrim, Some(session_id)) => self.background_trim(&session_id),
                (TimerKind::StuckCheck, Some(session_id)) => self.check_stuck(&session_id, now),
                (kind, None) => debug!(?kind, "session timer without session ignored"),
            }
        }
        fired
    }

    fn sweep_zombies(&mut self, now: Instant) {
        for session_id in self.eviction.mark_zombies(now) {
            if let Some(buffer) = self.buffers.get_mut(&session_id) {
                buffer.state.is_zombie = true;
            }
        }
        self.scheduler.schedule(
            None,
            TimerKind::ZombieSweep,
            now + self.config.zombie_sweep_interval(),
        );
        self.enforce_capacity();
    }

    fn background_trim(&mut self, session_id: &str) {
        if self.registry.current() == Some(session_id) {
            return;
        }
        let report = self.trim_buffer(session_id, self.config.background_trim_target());
        if let Some(buffer) = self.buffers.get_mut(session_id) {
            buffer.state.background_messages = 0;
        }
        trace!(session_id, removed = report.removed(), "background trim");
    }

    fn check_stuck(&mut self, session_id: &str, now: Instant) {
        if !self.streams.status(session_id).is_some_and(SessionStatus::is_active) {
            return;
        }
        let Some(last_activity) = self.streams.last_activity(session_id) else {
            return;
        };
        let timeout = self.config.stuck_timeout();
        if now.duration_since(last_activity) < timeout {
            self.scheduler
                .schedule(Some(session_id), TimerKind::StuckCheck, last_activity + timeout);
            return;
        }
        self.streams.reset_stuck(session_id, now);
        self.scheduler.cancel_for(Some(session_id), TimerKind::Cooldown);
        self.notices.push(MemoryNotice::StuckReset {
            session_id: session_id.to_string(),
        });
        self.after_settle(session_id, now);
    }

    // ── Views ────────────────────────────────────────────────────────────────

    /// Take the notices accumulated since the last call.
    pub fn drain_notices(&mut self) -> Vec<MemoryNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn view(&self, session_id: &str) -> Option<SessionView> {
        let buffer = self.buffers.get(session_id)?;
        Some(SessionView {
            session_id: session_id.to_string(),
            messages: buffer.window.messages().to_vec(),
            anchor: buffer.state.anchor.clone(),
            has_more_above: buffer.state.has_more_above,
            has_more_below: buffer.state.has_more_below,
            is_streaming: self.streams.is_streaming(session_id),
            history_loading: buffer.state.history_loading,
            load_failed: buffer.state.load_failed,
        })
    }

    pub fn state(&self, session_id: &str) -> Option<&SessionMemoryState> {
        self.buffers.get(session_id).map(|b| &b.state)
    }

    pub fn window(&self, session_id: &str) -> Option<&MessageWindow> {
        self.buffers.get(session_id).map(|b| &b.window)
    }

    pub fn lifecycle(&self, session_id: &str) -> Option<&MessageStreamLifecycle> {
        self.streams.lifecycle(session_id)
    }

    pub fn status(&self, session_id: &str) -> Option<&SessionStatus> {
        self.streams.status(session_id)
    }

    pub fn abort_flag(&self, session_id: &str) -> Option<&AbortFlag> {
        self.aborts.abort_flag(session_id)
    }

    pub fn abort_prompt(&self) -> Option<&AbortPrompt> {
        self.aborts.prompt()
    }

    pub fn paused(&self, session_id: &str) -> Option<&PauseSnapshot> {
        self.aborts.paused(session_id)
    }

    /// Hot sessions, most recently accessed first.
    pub fn hot_sessions(&self) -> Vec<SessionId> {
        self.eviction.hot_sessions()
    }

    pub fn is_hot(&self, session_id: &str) -> bool {
        self.eviction.is_hot(session_id)
    }

    pub fn pending_timer(&self, session_id: Option<&str>, kind: TimerKind) -> Option<Instant> {
        self.scheduler.pending(session_id, kind)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            sessions: self.registry.len(),
            hot_sessions: self.eviction.len(),
            zombies: self
                .eviction
                .hot_sessions()
                .iter()
                .filter(|id| self.eviction.is_zombie(id))
                .count(),
            buffered_messages: self.buffers.values().map(|b| b.window.len()).sum(),
            paused: self.aborts.paused_count(),
            pending_timers: self.scheduler.len(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn ensure_known(&self, session_id: &str) -> Result<()> {
        if self.registry.contains(session_id) || self.buffers.contains_key(session_id) {
            Ok(())
        } else {
            Err(MemoryError::UnknownSession(session_id.to_string()))
        }
    }

    fn buffer_mut(&mut self, session_id: &str, now: Instant) -> &mut SessionBuffer {
        self.buffers
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer::new(now))
    }

    fn window_len(&self, session_id: &str) -> usize {
        self.buffers.get(session_id).map_or(0, |b| b.window.len())
    }

    fn touch(&mut self, session_id: &str, now: Instant) {
        self.eviction.touch(session_id, now);
        if let Some(buffer) = self.buffers.get_mut(session_id) {
            buffer.state.last_accessed = now;
            buffer.state.is_zombie = false;
        }
    }

    fn initial_load_query(&mut self, session_id: &str) -> Option<HistoryQuery> {
        let buffer = self.buffers.get_mut(session_id)?;
        if !buffer.state.needs_initial_load || buffer.state.history_loading.is_some() {
            return None;
        }
        buffer.state.history_loading = Some(LoadDirection::Up);
        buffer.state.load_failed = false;
        let latest = HistoryQuery::latest(session_id, self.page_size);
        let query = match &buffer.state.reload {
            None => latest,
            Some(ReloadPoint::Before(id)) => HistoryQuery {
                before: Some(id.clone()),
                ..latest
            },
            Some(ReloadPoint::After(id)) => HistoryQuery {
                after: Some(id.clone()),
                ..latest
            },
        };
        debug!(session_id, reload = ?buffer.state.reload, "initial history load");
        Some(query)
    }

    /// Write-path policy: the current session is trimmed to the limit right
    /// away, a background session gets a debounced trim to the background
    /// target.
    fn after_write(&mut self, session_id: &str, stats: MergeStats, now: Instant) {
        self.touch(session_id, now);
        if self.registry.current() == Some(session_id) {
            if self.window_len(session_id) > self.config.message_limit {
                self.trim_buffer(session_id, self.config.message_limit);
            }
        } else if let Some(buffer) = self.buffers.get_mut(session_id) {
            buffer.state.background_messages += stats.inserted;
            if buffer.window.len() > self.config.background_trim_target() {
                self.scheduler.schedule(
                    Some(session_id),
                    TimerKind::BackgroundTrim,
                    now + self.config.trim_debounce(),
                );
            }
        }
        if stats.inserted + stats.updated > 0 {
            self.notices.push(MemoryNotice::WindowChanged {
                session_id: session_id.to_string(),
            });
        }
        self.enforce_capacity();
    }

    /// A stream stopped pinning the session: re-apply the size limits that
    /// were suspended while it ran.
    fn after_settle(&mut self, session_id: &str, now: Instant) {
        if self.registry.current() == Some(session_id) {
            if self.window_len(session_id) > self.config.message_limit {
                self.trim_buffer(session_id, self.config.message_limit);
            }
        } else if self.window_len(session_id) > self.config.background_trim_target() {
            self.scheduler.schedule(
                Some(session_id),
                TimerKind::BackgroundTrim,
                now + self.config.trim_debounce(),
            );
        }
        self.enforce_capacity();
    }

    /// First index of the in-flight turn: the user message that prompted the
    /// streaming assistant message, or the assistant message itself.
    fn protected_from(&self, session_id: &str) -> Option<usize> {
        let message_id = self.streams.active_message(session_id)?;
        let window = &self.buffers.get(session_id)?.window;
        let at = window.position(message_id)?;
        let prompt = window.messages()[..at]
            .iter()
            .rposition(|m| m.role == Role::User);
        Some(prompt.unwrap_or(at))
    }

    fn trim_buffer(&mut self, session_id: &str, target: usize) -> TrimReport {
        let protected = self.protected_from(session_id);
        let Some(buffer) = self.buffers.get_mut(session_id) else {
            return TrimReport::default();
        };
        let report = buffer.trim(target, protected);
        if report.removed() > 0 {
            debug!(
                session_id,
                target,
                removed_head = report.removed_head,
                removed_tail = report.removed_tail,
                retained = report.retained,
                "window trimmed"
            );
            self.notices.push(MemoryNotice::WindowChanged {
                session_id: session_id.to_string(),
            });
        }
        report
    }

    fn enforce_capacity(&mut self) {
        let streams = &self.streams;
        let victims = self
            .eviction
            .select_victims(self.registry.current(), |id| streams.is_pinned(id));
        for session_id in victims {
            self.evict(&session_id);
        }
    }

    fn evict(&mut self, session_id: &str) {
        self.eviction.remove(session_id);
        self.scheduler.cancel_for(Some(session_id), TimerKind::BackgroundTrim);
        if let Some(buffer) = self.buffers.get_mut(session_id) {
            let dropped = buffer.window.len();
            buffer.evict(self.page_size);
            info!(session_id, dropped, "session evicted");
        }
        self.notices.push(MemoryNotice::SessionEvicted {
            session_id: session_id.to_string(),
        });
    }
}

/// Ids of the oldest and newest record of a history page.
fn page_bounds(messages: &[MessageRecord]) -> (Option<String>, Option<String>) {
    let key = |m: &&MessageRecord| (m.order, m.id.clone());
    let first = messages.iter().min_by_key(key).map(|m| m.id.clone());
    let last = messages.iter().max_by_key(key).map(|m| m.id.clone());
    (first, last)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
