// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `MemoryService`: the event loop that owns a [`SessionMemory`].
//!
//! # Design
//!
//! ```text
//!   transport ──┐
//!               ├──► mpsc::Sender<Command> ──► MemoryService ── owns SessionMemory
//!   UI ─────────┘                                   │
//!                                                   │ spawns fetch / abort /
//!   renderer ◄── broadcast::Receiver<MemoryNotice> ◄┤ pause / resume tasks
//!                                                   │
//!   spawned task ──► completion_tx ──► service (applies the result)
//! ```
//!
//! Every mutation happens on the service task.  Network calls run in spawned
//! tasks and report back through an internal completion channel, so the loop
//! never blocks on the backend.  The loop also sleeps until the next timer
//! deadline of the controller and fires due timers.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use recall_config::Config;
//! # use recall_core::MemoryService;
//! # use recall_model::{InMemoryHistory, RecordingControl};
//! # async fn example() -> recall_core::Result<()> {
//! let (service, handle) = MemoryService::new(
//!     &Config::default(),
//!     Arc::new(InMemoryHistory::new()),
//!     Arc::new(RecordingControl::new()),
//! );
//! tokio::spawn(service.run());
//!
//! let mut notices = handle.subscribe();
//! handle.select_session("s1").await?;
//! while let Ok(notice) = notices.recv().await {
//!     println!("{notice:?}");
//! }
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use recall_config::{Config, HistoryConfig};
use recall_model::{
    HistoryPage, HistoryQuery, HistorySource, ModelSelection, PauseSnapshot, Session, SessionControl,
    SessionId, SessionPatch, TransportEvent,
};

use crate::abort::AbortDecision;
use crate::error::{MemoryError, Result};
use crate::memory::{MemoryNotice, MemoryStats, SessionMemory, SessionView};
use crate::window::{LoadDirection, TrimReport, ViewportAnchor};

/// Answer to one press of the abort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AbortOutcome {
    /// The confirmation prompt is armed; press again before it expires.
    Armed {
        #[serde(skip)]
        expires_at: Instant,
    },
    /// The backend confirmed the abort.
    Aborted,
    /// An earlier press is still waiting for the backend.
    InFlight,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Deliver(TransportEvent),
    UpsertSession(Session, Reply<bool>),
    UpdateSession(SessionId, SessionPatch, Reply<bool>),
    RemoveSession(SessionId, Reply<Session>),
    SessionsByDirectory(PathBuf, Reply<Vec<Session>>),
    Select(SessionId, Reply<()>),
    LoadMore(SessionId, LoadDirection, Reply<bool>),
    UpdateAnchor(SessionId, ViewportAnchor, Reply<Option<LoadDirection>>),
    Trim(SessionId, Option<usize>, Reply<TrimReport>),
    MarkSettled(SessionId, Reply<bool>),
    ArmAbortPrompt(SessionId, Option<Duration>, Reply<Instant>),
    RequestAbort(SessionId, Reply<AbortOutcome>),
    AcknowledgeAbort(SessionId, Reply<bool>),
    Pause(SessionId, ModelSelection, Reply<PauseSnapshot>),
    Resume(SessionId, Reply<PauseSnapshot>),
    Unpause(SessionId, Reply<()>),
    View(SessionId, Reply<Option<SessionView>>),
    Stats(Reply<MemoryStats>),
}

/// Results of spawned network tasks.
enum Completion {
    History {
        session_id: SessionId,
        direction: LoadDirection,
        result: std::result::Result<HistoryPage, String>,
    },
    Abort {
        session_id: SessionId,
        result: std::result::Result<(), String>,
    },
    Pause {
        snapshot: PauseSnapshot,
        result: std::result::Result<(), String>,
    },
    Resume {
        session_id: SessionId,
        result: std::result::Result<(), String>,
    },
    Unpause {
        session_id: SessionId,
        result: std::result::Result<(), String>,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to the running [`MemoryService`].
#[derive(Clone)]
pub struct MemoryHandle {
    cmd_tx: mpsc::Sender<Command>,
    notice_tx: broadcast::Sender<MemoryNotice>,
}

impl MemoryHandle {
    /// Subscribe to change notices.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryNotice> {
        self.notice_tx.subscribe()
    }

    /// Hand one transport event to the service.  Does not wait for it to be
    /// applied.
    pub async fn deliver(&self, event: TransportEvent) -> Result<()> {
        self.cmd_tx
            .send(Command::Deliver(event))
            .await
            .map_err(|_| MemoryError::ServiceClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| MemoryError::ServiceClosed)?;
        rx.await.map_err(|_| MemoryError::ServiceClosed)?
    }

    pub async fn upsert_session(&self, session: Session) -> Result<bool> {
        self.request(|tx| Command::UpsertSession(session, tx)).await
    }

    pub async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<bool> {
        self.request(|tx| Command::UpdateSession(session_id.to_string(), patch, tx))
            .await
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<Session> {
        self.request(|tx| Command::RemoveSession(session_id.to_string(), tx))
            .await
    }

    pub async fn sessions_by_directory(&self, directory: impl Into<PathBuf>) -> Result<Vec<Session>> {
        let directory = directory.into();
        self.request(|tx| Command::SessionsByDirectory(directory, tx)).await
    }

    /// Make `session_id` current.  Returns immediately; an initial history
    /// load, if needed, runs in the background.
    pub async fn select_session(&self, session_id: &str) -> Result<()> {
        self.request(|tx| Command::Select(session_id.to_string(), tx)).await
    }

    /// Start loading more history.  Returns `false` when nothing was started
    /// (already loading, or nothing more to load).
    pub async fn load_more(&self, session_id: &str, direction: LoadDirection) -> Result<bool> {
        self.request(|tx| Command::LoadMore(session_id.to_string(), direction, tx))
            .await
    }

    /// Record the read position.  A fetch triggered by the new position is
    /// started automatically and its direction returned.
    pub async fn update_anchor(&self, session_id: &str, anchor: ViewportAnchor) -> Result<Option<LoadDirection>> {
        self.request(|tx| Command::UpdateAnchor(session_id.to_string(), anchor, tx))
            .await
    }

    pub async fn trim(&self, session_id: &str, target: Option<usize>) -> Result<TrimReport> {
        self.request(|tx| Command::Trim(session_id.to_string(), target, tx))
            .await
    }

    pub async fn mark_settled(&self, session_id: &str) -> Result<bool> {
        self.request(|tx| Command::MarkSettled(session_id.to_string(), tx))
            .await
    }

    pub async fn arm_abort_prompt(&self, session_id: &str, duration: Option<Duration>) -> Result<Instant> {
        self.request(|tx| Command::ArmAbortPrompt(session_id.to_string(), duration, tx))
            .await
    }

    /// One press of the abort key.  A confirming press resolves once the
    /// backend has answered; a backend failure is returned as an error.
    pub async fn request_abort(&self, session_id: &str) -> Result<AbortOutcome> {
        self.request(|tx| Command::RequestAbort(session_id.to_string(), tx))
            .await
    }

    pub async fn acknowledge_abort(&self, session_id: &str) -> Result<bool> {
        self.request(|tx| Command::AcknowledgeAbort(session_id.to_string(), tx))
            .await
    }

    /// Pause a session.  Resolves once the snapshot is persisted remotely.
    pub async fn pause(&self, session_id: &str, selection: ModelSelection) -> Result<PauseSnapshot> {
        self.request(|tx| Command::Pause(session_id.to_string(), selection, tx))
            .await
    }

    /// Resume a paused session.  Needs no history fetch.
    pub async fn resume(&self, session_id: &str) -> Result<PauseSnapshot> {
        self.request(|tx| Command::Resume(session_id.to_string(), tx)).await
    }

    /// Discard a pause without resuming.
    pub async fn unpause(&self, session_id: &str) -> Result<()> {
        self.request(|tx| Command::Unpause(session_id.to_string(), tx)).await
    }

    pub async fn view(&self, session_id: &str) -> Result<Option<SessionView>> {
        self.request(|tx| Command::View(session_id.to_string(), tx)).await
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.request(Command::Stats).await
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct MemoryService {
    memory: SessionMemory,
    history: Arc<dyn HistorySource>,
    control: Arc<dyn SessionControl>,
    retry: HistoryConfig,
    cmd_rx: mpsc::Receiver<Command>,
    completion_rx: mpsc::Receiver<Completion>,
    completion_tx: mpsc::Sender<Completion>,
    notice_tx: broadcast::Sender<MemoryNotice>,
    /// Callers waiting for a remote operation, keyed by session.
    pending_aborts: HashMap<SessionId, Reply<AbortOutcome>>,
    pending_pauses: HashMap<SessionId, Reply<PauseSnapshot>>,
    pending_resumes: HashMap<SessionId, Reply<PauseSnapshot>>,
    pending_unpauses: HashMap<SessionId, Reply<()>>,
}

impl MemoryService {
    /// Construct the service and return a cheap [`MemoryHandle`] to it.
    pub fn new(
        config: &Config,
        history: Arc<dyn HistorySource>,
        control: Arc<dyn SessionControl>,
    ) -> (Self, MemoryHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (completion_tx, completion_rx) = mpsc::channel(64);
        let (notice_tx, _) = broadcast::channel(1024);

        let handle = MemoryHandle {
            cmd_tx,
            notice_tx: notice_tx.clone(),
        };
        let service = Self {
            memory: SessionMemory::new(config, Instant::now()),
            history,
            control,
            retry: config.history.clone(),
            cmd_rx,
            completion_rx,
            completion_tx,
            notice_tx,
            pending_aborts: HashMap::new(),
            pending_pauses: HashMap::new(),
            pending_resumes: HashMap::new(),
            pending_unpauses: HashMap::new(),
        };
        (service, handle)
    }

    /// Run until every [`MemoryHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("memory service started");
        loop {
            let deadline = self.memory.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(done) = self.completion_rx.recv() => self.handle_completion(done),
                _ = timer => {
                    let fired = self.memory.fire_due_timers(Instant::now());
                    debug!(fired, "timers fired");
                }
            }
            self.flush_notices();
        }
        info!("memory service stopped");
    }

    fn flush_notices(&mut self) {
        for notice in self.memory.drain_notices() {
            // No subscribers is fine.
            let _ = self.notice_tx.send(notice);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Deliver(event) => self.memory.apply_event(event, now),
            Command::UpsertSession(session, reply) => {
                let _ = reply.send(Ok(self.memory.upsert_session(session)));
            }
            Command::UpdateSession(id, patch, reply) => {
                let _ = reply.send(self.memory.update_session(&id, &patch));
            }
            Command::RemoveSession(id, reply) => {
                self.fail_pending(&id);
                let _ = reply.send(self.memory.remove_session(&id));
            }
            Command::SessionsByDirectory(dir, reply) => {
                let _ = reply.send(Ok(self.memory.get_sessions_by_directory(&dir)));
            }
            Command::Select(id, reply) => {
                let result = self.memory.set_current_session(&id, now).map(|query| {
                    if let Some(query) = query {
                        self.spawn_fetch(LoadDirection::Up, query);
                    }
                });
                let _ = reply.send(result);
            }
            Command::LoadMore(id, direction, reply) => {
                let result = self.memory.load_more_messages(&id, direction, now).map(|query| {
                    query
                        .map(|query| self.spawn_fetch(direction, query))
                        .is_some()
                });
                let _ = reply.send(result);
            }
            Command::UpdateAnchor(id, anchor, reply) => {
                let result = self.memory.update_viewport_anchor(&id, anchor, now);
                if let Ok(Some(direction)) = result {
                    if let Ok(Some(query)) = self.memory.load_more_messages(&id, direction, now) {
                        self.spawn_fetch(direction, query);
                    }
                }
                let _ = reply.send(result);
            }
            Command::Trim(id, target, reply) => {
                let _ = reply.send(self.memory.trim_to_viewport_window(&id, target));
            }
            Command::MarkSettled(id, reply) => {
                let _ = reply.send(Ok(self.memory.mark_message_stream_settled(&id, now)));
            }
            Command::ArmAbortPrompt(id, duration, reply) => {
                let _ = reply.send(self.memory.arm_abort_prompt(&id, duration, now));
            }
            Command::RequestAbort(id, reply) => match self.memory.request_abort(&id, now) {
                Ok(AbortDecision::Armed { expires_at }) => {
                    let _ = reply.send(Ok(AbortOutcome::Armed { expires_at }));
                }
                Ok(AbortDecision::InFlight) => {
                    let _ = reply.send(Ok(AbortOutcome::InFlight));
                }
                Ok(AbortDecision::Fire) => {
                    self.pending_aborts.insert(id.clone(), reply);
                    self.spawn_abort(id);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::AcknowledgeAbort(id, reply) => {
                let _ = reply.send(Ok(self.memory.acknowledge_session_abort(&id)));
            }
            Command::Pause(id, selection, reply) => match self.memory.pause_session(&id, selection) {
                Ok(snapshot) => {
                    self.pending_pauses.insert(id, reply);
                    self.spawn_pause(snapshot);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Resume(id, reply) => match self.memory.resume_session(&id) {
                Ok(snapshot) => {
                    self.pending_resumes.insert(id, reply);
                    self.spawn_resume(snapshot);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Unpause(id, reply) => match self.memory.unpause_session(&id) {
                Ok(_) => {
                    self.pending_unpauses.insert(id.clone(), reply);
                    self.spawn_unpause(id);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::View(id, reply) => {
                let _ = reply.send(Ok(self.memory.view(&id)));
            }
            Command::Stats(reply) => {
                let _ = reply.send(Ok(self.memory.stats()));
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        let now = Instant::now();
        match done {
            Completion::History {
                session_id,
                direction,
                result,
            } => self.memory.apply_history_page(&session_id, direction, result, now),
            Completion::Abort { session_id, result } => {
                let reply = self.pending_aborts.remove(&session_id);
                let outcome = match result {
                    Ok(()) => {
                        self.memory.confirm_abort(&session_id, now);
                        Ok(AbortOutcome::Aborted)
                    }
                    Err(message) => {
                        self.memory.fail_abort(&session_id, &message);
                        Err(remote("abort", &session_id, message))
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Completion::Pause { snapshot, result } => {
                let session_id = snapshot.session_id.clone();
                let reply = self.pending_pauses.remove(&session_id);
                let outcome = match result {
                    Ok(()) => {
                        self.memory.complete_pause(snapshot.clone());
                        Ok(snapshot)
                    }
                    Err(message) => {
                        self.memory.cancel_pause_op(&session_id, &message);
                        Err(remote("pause", &session_id, message))
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Completion::Resume { session_id, result } => {
                let reply = self.pending_resumes.remove(&session_id);
                let outcome = match result {
                    Ok(()) => self
                        .memory
                        .complete_resume(&session_id)
                        .ok_or_else(|| MemoryError::NotPaused(session_id.clone())),
                    Err(message) => {
                        self.memory.cancel_pause_op(&session_id, &message);
                        Err(remote("resume", &session_id, message))
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Completion::Unpause { session_id, result } => {
                let reply = self.pending_unpauses.remove(&session_id);
                let outcome = match result {
                    Ok(()) => {
                        self.memory.complete_unpause(&session_id);
                        Ok(())
                    }
                    Err(message) => {
                        self.memory.cancel_pause_op(&session_id, &message);
                        Err(remote("unpause", &session_id, message))
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    /// Drop waiters of a session that is being removed.
    fn fail_pending(&mut self, session_id: &str) {
        let closed = || MemoryError::UnknownSession(session_id.to_string());
        if let Some(reply) = self.pending_aborts.remove(session_id) {
            let _ = reply.send(Err(closed()));
        }
        if let Some(reply) = self.pending_pauses.remove(session_id) {
            let _ = reply.send(Err(closed()));
        }
        if let Some(reply) = self.pending_resumes.remove(session_id) {
            let _ = reply.send(Err(closed()));
        }
        if let Some(reply) = self.pending_unpauses.remove(session_id) {
            let _ = reply.send(Err(closed()));
        }
    }

    // ── Spawned network work ─────────────────────────────────────────────────

    /// Fetch one history page, retrying transient failures with exponential
    /// backoff.
    fn spawn_fetch(&self, direction: LoadDirection, query: HistoryQuery) {
        let history = Arc::clone(&self.history);
        let done = self.completion_tx.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let session_id = query.session_id.clone();
            let mut delay = retry.backoff();
            let mut attempt = 1;
            let result = loop {
                match history.fetch(query.clone()).await {
                    Ok(page) => break Ok(page),
                    Err(e) if attempt < retry.max_attempts => {
                        debug!(session_id = %session_id, attempt, error = %e, "history fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        attempt += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, attempts = attempt, error = %e, "history fetch gave up");
                        break Err(format!("{e:#}"));
                    }
                }
            };
            let _ = done
                .send(Completion::History {
                    session_id,
                    direction,
                    result,
                })
                .await;
        });
    }

    fn spawn_abort(&self, session_id: SessionId) {
        let control = Arc::clone(&self.control);
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = control.abort(&session_id).await.map_err(|e| format!("{e:#}"));
            let _ = done.send(Completion::Abort { session_id, result }).await;
        });
    }

    fn spawn_pause(&self, snapshot: PauseSnapshot) {
        let control = Arc::clone(&self.control);
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = control
                .persist_pause(&snapshot)
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = done.send(Completion::Pause { snapshot, result }).await;
        });
    }

    fn spawn_resume(&self, snapshot: PauseSnapshot) {
        let control = Arc::clone(&self.control);
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = control.resume(&snapshot).await.map_err(|e| format!("{e:#}"));
            let _ = done
                .send(Completion::Resume {
                    session_id: snapshot.session_id,
                    result,
                })
                .await;
        });
    }

    fn spawn_unpause(&self, session_id: SessionId) {
        let control = Arc::clone(&self.control);
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = control
                .discard_pause(&session_id)
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = done.send(Completion::Unpause { session_id, result }).await;
        });
    }
}

fn remote(op: &'static str, session_id: &str, message: String) -> MemoryError {
    MemoryError::Remote {
        op,
        session_id: session_id.to_string(),
        message,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recall_model::{InMemoryHistory, MessageRecord, RecordingControl, SessionStatus};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            directory: "/work".into(),
            title: id.into(),
            shared: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.history.backoff_ms = 1;
        config
    }

    async fn start(
        config: Config,
        history: Arc<InMemoryHistory>,
        control: Arc<RecordingControl>,
    ) -> MemoryHandle {
        let (svc, handle) = MemoryService::new(&config, history, control);
        tokio::spawn(svc.run());
        handle
    }

    async fn wait_loaded(handle: &MemoryHandle, id: &str) -> SessionView {
        timeout(WAIT, async {
            loop {
                if let Some(view) = handle.view(id).await.unwrap() {
                    if view.history_loading.is_none() {
                        return view;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("history load timed out")
    }

    #[tokio::test]
    async fn select_loads_latest_page_in_background() {
        let history = Arc::new(InMemoryHistory::new());
        history.insert(
            "s1",
            (1..=80).map(|i| MessageRecord::user(format!("m{i:03}"), i, "x")).collect(),
        );
        let handle = start(fast_config(), history.clone(), Arc::new(RecordingControl::new())).await;
        handle.upsert_session(session("s1")).await.unwrap();
        handle.select_session("s1").await.unwrap();

        let view = wait_loaded(&handle, "s1").await;
        assert_eq!(view.messages.len(), 50);
        assert!(view.has_more_above);
        assert_eq!(history.calls(), 1);
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried() {
        let history = Arc::new(InMemoryHistory::new());
        history.insert("s1", vec![MessageRecord::user("m1", 1, "hi")]);
        history.fail_next(2);
        let handle = start(fast_config(), history.clone(), Arc::new(RecordingControl::new())).await;
        handle.upsert_session(session("s1")).await.unwrap();
        handle.select_session("s1").await.unwrap();

        let view = wait_loaded(&handle, "s1").await;
        assert!(!view.load_failed);
        assert_eq!(view.messages.len(), 1);
        assert_eq!(history.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_flag_load_failed() {
        let history = Arc::new(InMemoryHistory::new());
        history.fail_next(10);
        let handle = start(fast_config(), history.clone(), Arc::new(RecordingControl::new())).await;
        let mut notices = handle.subscribe();
        handle.upsert_session(session("s1")).await.unwrap();
        handle.select_session("s1").await.unwrap();

        let view = wait_loaded(&handle, "s1").await;
        assert!(view.load_failed);
        assert_eq!(history.calls(), 3);
        let failed = timeout(WAIT, async {
            loop {
                if let Ok(MemoryNotice::LoadFailed { session_id, .. }) = notices.recv().await {
                    return session_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed, "s1");
    }

    #[tokio::test]
    async fn abort_failure_is_returned_and_not_retried() {
        let control = Arc::new(RecordingControl::new());
        control.set_failing("abort", true);
        let handle = start(fast_config(), Arc::new(InMemoryHistory::new()), control.clone()).await;
        handle.upsert_session(session("s1")).await.unwrap();
        handle
            .deliver(TransportEvent::StatusChange {
                session_id: "s1".into(),
                status: SessionStatus::Busy,
            })
            .await
            .unwrap();

        assert!(matches!(handle.request_abort("s1").await.unwrap(), AbortOutcome::Armed { .. }));
        let err = handle.request_abort("s1").await.unwrap_err();
        assert!(matches!(err, MemoryError::Remote { op: "abort", .. }));
        assert_eq!(control.count("abort"), 1);

        control.set_failing("abort", false);
        assert_eq!(handle.request_abort("s1").await.unwrap(), AbortOutcome::Aborted);
        assert_eq!(control.count("abort"), 2);
    }

    #[tokio::test]
    async fn pause_failure_leaves_session_unpaused() {
        let control = Arc::new(RecordingControl::new());
        control.set_failing("persist_pause", true);
        let handle = start(fast_config(), Arc::new(InMemoryHistory::new()), control.clone()).await;
        handle.upsert_session(session("s1")).await.unwrap();

        let err = handle.pause("s1", ModelSelection::default()).await.unwrap_err();
        assert!(matches!(err, MemoryError::Remote { op: "pause", .. }));
        assert_eq!(
            handle.resume("s1").await.unwrap_err(),
            MemoryError::NotPaused("s1".into())
        );
        assert!(control.calls().iter().all(|c| !c.starts_with("resume")));
    }

    #[tokio::test]
    async fn dropping_all_handles_stops_the_service() {
        let (svc, handle) = MemoryService::new(
            &Config::default(),
            Arc::new(InMemoryHistory::new()),
            Arc::new(RecordingControl::new()),
        );
        let task = tokio::spawn(svc.run());
        drop(handle);
        timeout(WAIT, task).await.unwrap().unwrap();
    }
}
