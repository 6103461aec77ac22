// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Explicit, cancellable deadlines.
//!
//! The scheduler never sleeps itself: the owner asks for
//! [`Scheduler::next_deadline`], waits until then, and drains
//! [`Scheduler::pop_due`].  Scheduling a task for a `(session, kind)` pair
//! that already has one replaces it, which debounces repeated writes.
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;

use recall_model::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Settle a stream whose backend went idle.
    Cooldown,
    /// Shrink a background session to the background target.
    BackgroundTrim,
    /// Check a busy session for inactivity.
    StuckCheck,
    /// Drop the abort confirmation prompt.
    AbortPromptExpiry,
    /// Mark idle hot sessions as zombies.
    ZombieSweep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub handle: TaskHandle,
    pub kind: TimerKind,
    pub session_id: Option<SessionId>,
    pub deadline: Instant,
}

type TaskKey = (Option<SessionId>, TimerKind);

#[derive(Debug, Default)]
pub struct Scheduler {
    next_handle: u64,
    queue: BTreeMap<(Instant, TaskHandle), ScheduledTask>,
    by_key: HashMap<TaskKey, (Instant, TaskHandle)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedule `kind` for `session_id` at `deadline`, replacing a pending
    /// task with the same key.
    pub fn schedule(&mut self, session_id: Option<&str>, kind: TimerKind, deadline: Instant) -> TaskHandle {
        let key = (session_id.map(str::to_string), kind);
        if let Some(old) = self.by_key.remove(&key) {
            self.queue.remove(&old);
        }
        self.next_handle += 1;
        let handle = TaskHandle(self.next_handle);
        self.queue.insert(
            (deadline, handle),
            ScheduledTask {
                handle,
                kind,
                session_id: key.0.clone(),
                deadline,
            },
        );
        self.by_key.insert(key, (deadline, handle));
        handle
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let Some(key) = self.queue.keys().find(|(_, h)| *h == handle).copied() else {
            return false;
        };
        if let Some(task) = self.queue.remove(&key) {
            self.by_key.remove(&(task.session_id, task.kind));
        }
        true
    }

    /// Cancel the pending `kind` task of `session_id`.
    pub fn cancel_for(&mut self, session_id: Option<&str>, kind: TimerKind) -> bool {
        let key = (session_id.map(str::to_string), kind);
        match self.by_key.remove(&key) {
            Some(entry) => self.queue.remove(&entry).is_some(),
            None => false,
        }
    }

    /// Cancel every task of `session_id`.  Returns how many were pending.
    pub fn cancel_session(&mut self, session_id: &str) -> usize {
        let keys: Vec<TaskKey> = self
            .by_key
            .keys()
            .filter(|(sid, _)| sid.as_deref() == Some(session_id))
            .cloned()
            .collect();
        keys.iter()
            .filter(|key| self.cancel_for(key.0.as_deref(), key.1))
            .count()
    }

    pub fn pending(&self, session_id: Option<&str>, kind: TimerKind) -> Option<Instant> {
        self.by_key
            .get(&(session_id.map(str::to_string), kind))
            .map(|(deadline, _)| *deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every task due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let task = entry.remove();
            self.by_key.remove(&(task.session_id.clone(), task.kind));
            due.push(task);
        }
        due
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
