// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::{MessageRecord, Part, Role, SessionId, SessionPatch};

/// Backend-reported activity state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    /// The backend is retrying a failed provider call.
    Retry { attempt: u32, message: String },
}

impl SessionStatus {
    /// `true` while the backend claims to be working on a turn.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionStatus::Idle)
    }
}

/// One event pushed by the transport.
///
/// Delivery is at-least-once and possibly reordered; consumers must apply
/// events idempotently.
///
/// Events are encoded as JSON objects tagged by `event`:
///
/// ```json
/// {"event":"message-part","session_id":"s1","message_id":"m2","role":"assistant",
///  "order":2,"part":{"id":"m2-p0","type":"text","text":"Hel"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TransportEvent {
    /// A (possibly partial) part of a message, typically a streaming delta.
    MessagePart {
        session_id: SessionId,
        message_id: String,
        role: Role,
        order: u64,
        part: Part,
    },
    /// A full or partial copy of a message record.
    MessageUpdated {
        session_id: SessionId,
        message: MessageRecord,
    },
    StatusChange {
        session_id: SessionId,
        status: SessionStatus,
    },
    SessionUpdated { session: SessionPatch },
}

impl TransportEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TransportEvent::MessagePart { session_id, .. }
            | TransportEvent::MessageUpdated { session_id, .. }
            | TransportEvent::StatusChange { session_id, .. } => session_id,
            TransportEvent::SessionUpdated { session } => &session.id,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
