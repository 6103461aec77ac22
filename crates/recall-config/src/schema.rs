// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Config {
    /// Reject values the memory manager cannot operate with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.memory.validate()?;
        self.history.validate()?;
        Ok(())
    }
}

fn default_message_limit() -> usize {
    200
}
fn default_background_trim_ratio() -> f32 {
    0.6
}
fn default_max_sessions() -> usize {
    5
}
fn default_zombie_timeout_secs() -> u64 {
    30 * 60
}
fn default_zombie_sweep_secs() -> u64 {
    60
}
fn default_stuck_timeout_secs() -> u64 {
    5 * 60
}
fn default_cooldown_ms() -> u64 {
    1_500
}
fn default_abort_prompt_ms() -> u64 {
    3_000
}
fn default_trim_debounce_ms() -> u64 {
    2_000
}
fn default_summary_messages() -> usize {
    4
}
fn default_summary_chars() -> usize {
    200
}

/// Limits and timers for the in-memory session windows.
///
/// `message_limit` is the only size knob users normally touch.  The
/// background trim target is derived from it (see
/// [`MemoryConfig::background_trim_target`]) so a session that scrolls out of
/// focus shrinks well below the ceiling and has headroom before the next trim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of messages kept in the window of the current session.
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    /// Fraction of `message_limit` a background session is trimmed down to.
    #[serde(default = "default_background_trim_ratio")]
    pub background_trim_ratio: f32,
    /// Maximum number of sessions whose window is materialized ("hot").
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle time after which a hot session is marked as a zombie and becomes
    /// the first eviction candidate.
    #[serde(default = "default_zombie_timeout_secs")]
    pub zombie_timeout_secs: u64,
    /// Interval of the zombie sweep.
    #[serde(default = "default_zombie_sweep_secs")]
    pub zombie_sweep_secs: u64,
    /// A session reported busy / retrying with no activity for this long is
    /// force-reset to idle.
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
    /// Grace window after the backend reports a turn finished, used to
    /// coalesce trailing events before the stream is considered settled.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Lifetime of the "press abort again to confirm" prompt.
    #[serde(default = "default_abort_prompt_ms")]
    pub abort_prompt_ms: u64,
    /// Debounce applied to background trims after writes.
    #[serde(default = "default_trim_debounce_ms")]
    pub trim_debounce_ms: u64,
    /// Number of trailing messages quoted in a pause snapshot summary.
    #[serde(default = "default_summary_messages")]
    pub summary_messages: usize,
    /// Per-message character cap inside a pause snapshot summary.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            message_limit: default_message_limit(),
            background_trim_ratio: default_background_trim_ratio(),
            max_sessions: default_max_sessions(),
            zombie_timeout_secs: default_zombie_timeout_secs(),
            zombie_sweep_secs: default_zombie_sweep_secs(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            cooldown_ms: default_cooldown_ms(),
            abort_prompt_ms: default_abort_prompt_ms(),
            trim_debounce_ms: default_trim_debounce_ms(),
            summary_messages: default_summary_messages(),
            summary_chars: default_summary_chars(),
        }
    }
}

impl MemoryConfig {
    /// Size a background session is trimmed to: `message_limit × ratio`,
    /// rounded down, never below one message.
    pub fn background_trim_target(&self) -> usize {
        // The epsilon absorbs f32 representation error (0.7 is stored as 0.6999…).
        let exact = self.message_limit as f64 * f64::from(self.background_trim_ratio);
        ((exact + 1e-6).floor() as usize).max(1)
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }

    pub fn zombie_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_sweep_secs.max(1))
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn abort_prompt(&self) -> Duration {
        Duration::from_millis(self.abort_prompt_ms)
    }

    pub fn trim_debounce(&self) -> Duration {
        Duration::from_millis(self.trim_debounce_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.message_limit == 0 {
            anyhow::bail!("memory.message_limit must be greater than zero");
        }
        if !(self.background_trim_ratio > 0.0 && self.background_trim_ratio <= 1.0) {
            anyhow::bail!(
                "memory.background_trim_ratio must be in (0, 1], got {}",
                self.background_trim_ratio
            );
        }
        if self.max_sessions == 0 {
            anyhow::bail!("memory.max_sessions must be at least 1");
        }
        Ok(())
    }
}

fn default_page_size() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    250
}

/// Paging and retry behaviour of the history-fetch collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages requested per history page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Attempts per page before the session is flagged `load_failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on every further attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl HistoryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.page_size == 0 {
            anyhow::bail!("history.page_size must be greater than zero");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("history.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
