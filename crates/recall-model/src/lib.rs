// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Data model and collaborator interfaces shared by the session memory
//! manager and its hosts.
//!
//! Nothing in this crate owns state: the types describe sessions, messages
//! and transport events, and the traits describe the remote services the
//! memory manager calls out to (history paging and session control).
mod session;
mod message;
mod event;
mod history;
mod control;
pub mod mock;

pub use session::{Session, SessionId, SessionPatch};
pub use message::{MessageRecord, Part, PartContent, Role};
pub use event::{SessionStatus, TransportEvent};
pub use history::{HistoryPage, HistoryQuery, HistorySource};
pub use control::{ModelSelection, PauseSnapshot, SessionControl};
pub use mock::{InMemoryHistory, RecordingControl};
