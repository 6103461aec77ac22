// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::{MessageRecord, SessionId};

/// One page request against the backend history store.
///
/// `before` / `after` are message ids (exclusive bounds).  With neither set
/// the newest `limit` messages are requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub session_id: SessionId,
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn latest(session_id: impl Into<SessionId>, limit: usize) -> Self {
        Self {
            session_id: session_id.into(),
            before: None,
            after: None,
            limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Messages in server order.
    pub messages: Vec<MessageRecord>,
    /// More (older) history exists before the first returned message.
    pub has_more_before: bool,
    /// More (newer) history exists after the last returned message.
    pub has_more_after: bool,
}

/// Paginated access to the persistent history of a session.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, query: HistoryQuery) -> anyhow::Result<HistoryPage>;
}
