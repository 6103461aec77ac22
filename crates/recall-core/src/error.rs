// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("unknown message '{message_id}' in session '{session_id}'")]
    UnknownMessage {
        session_id: String,
        message_id: String,
    },

    #[error("session '{0}' is already paused")]
    AlreadyPaused(String),

    #[error("session '{0}' is not paused")]
    NotPaused(String),

    #[error("a pause operation is already in flight for session '{0}'")]
    PauseInFlight(String),

    #[error("{op} failed for session '{session_id}': {message}")]
    Remote {
        op: &'static str,
        session_id: String,
        message: String,
    },

    #[error("memory service has shut down")]
    ServiceClosed,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
