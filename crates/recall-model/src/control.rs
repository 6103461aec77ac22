// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Provider / model / agent the user had selected for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub agent: Option<String>,
}

/// Everything needed to resume a suspended turn later, independent of
/// whether the session's messages are still held in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSnapshot {
    pub session_id: SessionId,
    pub paused_at: DateTime<Utc>,
    pub last_user_message_id: Option<String>,
    pub last_user_text: Option<String>,
    pub selection: ModelSelection,
    /// Short rolling summary of the most recent messages.
    pub context_summary: String,
}

/// Remote session operations.
///
/// All of them are best-effort: callers surface failures and never retry
/// on their own, so an implementation must not double-fire either.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Cancel the in-flight turn of `session_id`.
    async fn abort(&self, session_id: &str) -> anyhow::Result<()>;

    /// Persist a pause snapshot so it survives a restart of the client.
    async fn persist_pause(&self, snapshot: &PauseSnapshot) -> anyhow::Result<()>;

    /// Resume the logical turn described by `snapshot`.
    async fn resume(&self, snapshot: &PauseSnapshot) -> anyhow::Result<()>;

    /// Drop a persisted snapshot without resuming.
    async fn discard_pause(&self, session_id: &str) -> anyhow::Result<()>;
}
