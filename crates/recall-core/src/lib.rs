// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded, per-session message memory for a multi-session chat client.
//!
//! [`SessionMemory`] keeps a sliding window of messages for every session the
//! user touches, merges streamed and paged deliveries idempotently, trims
//! windows around the reader's viewport, and evicts whole sessions when too
//! many are hot.  It also tracks the streaming lifecycle of assistant
//! messages, the two-press abort prompt, and pause snapshots that outlive
//! eviction.
//!
//! [`MemoryService`] runs a `SessionMemory` on a tokio task, performs the
//! remote calls and drives the timers; hosts talk to it through a
//! [`MemoryHandle`].
mod abort;
mod error;
mod eviction;
mod lifecycle;
mod memory;
mod registry;
mod service;
mod timers;
mod window;

pub use abort::{AbortCoordinator, AbortDecision, AbortFlag, AbortPrompt};
pub use error::{MemoryError, Result};
pub use eviction::EvictionPolicy;
pub use lifecycle::{MessageStreamLifecycle, PartDisposition, StreamPhase, StreamTracker};
pub use memory::{MemoryNotice, MemoryStats, SessionMemory, SessionView};
pub use registry::{MetadataOutcome, SessionRegistry};
pub use service::{AbortOutcome, MemoryHandle, MemoryService};
pub use timers::{ScheduledTask, Scheduler, TaskHandle, TimerKind};
pub use window::{
    plan_trim, LoadDirection, MergeStats, MessageWindow, ReloadPoint, SessionBuffer, SessionMemoryState,
    TrimReport, ViewportAnchor,
};
