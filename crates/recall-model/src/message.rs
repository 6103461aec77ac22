// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Payload of one message part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartContent {
    Text { text: String },
    Attachment {
        name: String,
        mime_type: String,
        url: String,
    },
    /// Context injected by the client or backend (file excerpts, reminders)
    /// that is part of the turn but was not typed by the user.
    Context { text: String },
}

/// One addressable piece of a message.  Streaming updates re-send a part
/// with the same id and the newer content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(flatten)]
    pub content: PartContent,
}

impl Part {
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: PartContent::Text { text: text.into() },
        }
    }

    pub fn context(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: PartContent::Context { text: text.into() },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            PartContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One chat message as held in a session window.
///
/// `order` is the server-assigned ordering key.  Windows sort by
/// `(order, id)` and never by arrival time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: Role,
    pub order: u64,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl MessageRecord {
    pub fn new(id: impl Into<String>, role: Role, order: u64) -> Self {
        Self {
            id: id.into(),
            role,
            order,
            parts: Vec::new(),
        }
    }

    pub fn user(id: impl Into<String>, order: u64, text: impl Into<String>) -> Self {
        let id = id.into();
        let part = Part::text(format!("{id}-p0"), text);
        Self::new(id, Role::User, order).with_part(part)
    }

    pub fn assistant(id: impl Into<String>, order: u64, text: impl Into<String>) -> Self {
        let id = id.into();
        let part = Part::text(format!("{id}-p0"), text);
        Self::new(id, Role::Assistant, order).with_part(part)
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.upsert_part(part);
        self
    }

    /// Insert `part`, replacing an existing part with the same id in place.
    ///
    /// Returns `true` when the part list changed.
    pub fn upsert_part(&mut self, part: Part) -> bool {
        match self.parts.iter_mut().find(|p| p.id == part.id) {
            Some(existing) if *existing == part => false,
            Some(existing) => {
                *existing = part;
                true
            }
            None => {
                self.parts.push(part);
                true
            }
        }
    }

    /// Merge a redelivered copy of this message into `self`.
    ///
    /// Attributes take the incoming value (last write wins); parts are
    /// upserted by id so a partial redelivery never drops content already
    /// seen.  Returns `true` when anything changed.
    pub fn merge_from(&mut self, other: MessageRecord) -> bool {
        let mut changed = false;
        if self.role != other.role {
            self.role = other.role;
            changed = true;
        }
        if self.order != other.order {
            self.order = other.order;
            changed = true;
        }
        for part in other.parts {
            changed |= self.upsert_part(part);
        }
        changed
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
