// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `recall replay`: drive a [`MemoryService`] from a captured event stream.
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{debug, info};

use recall_config::Config;
use recall_core::{MemoryHandle, MemoryService, MemoryStats, SessionView};
use recall_model::{InMemoryHistory, RecordingControl, TransportEvent};

use crate::cli::ReplayArgs;

/// Upper bound on how long a selection waits for its history page.
const LOAD_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub events: usize,
    pub sessions: Vec<SessionView>,
    pub stats: MemoryStats,
}

/// Apply the command-line overrides on top of the loaded config.
pub fn apply_overrides(config: &mut Config, args: &ReplayArgs) -> anyhow::Result<()> {
    if let Some(limit) = args.limit {
        config.memory.message_limit = limit;
    }
    if let Some(max) = args.max_sessions {
        config.memory.max_sessions = max;
    }
    if let Some(timeout) = args.zombie_timeout {
        config.memory.zombie_timeout_secs = timeout.as_secs();
    }
    config.validate().context("invalid replay overrides")
}

/// Parse one transport event per line.  Blank lines and `#` comments are
/// skipped.
pub fn parse_events(text: &str) -> anyhow::Result<Vec<TransportEvent>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("event on line {}", n + 1))
        })
        .collect()
}

pub async fn run(config: Config, args: &ReplayArgs) -> anyhow::Result<ReplayReport> {
    let events = read_events(&args.events)?;
    let history = match &args.history {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading history file {}", path.display()))?;
            InMemoryHistory::from_jsonl(&text)
                .with_context(|| format!("parsing history file {}", path.display()))?
        }
        None => InMemoryHistory::new(),
    };

    let mut session_ids: BTreeSet<String> = history.session_ids().into_iter().collect();
    session_ids.extend(events.iter().map(|e| e.session_id().to_string()));
    session_ids.extend(args.select.iter().cloned());

    let (service, handle) = MemoryService::new(&config, Arc::new(history), Arc::new(RecordingControl::new()));
    let task = tokio::spawn(service.run());

    let count = events.len();
    for event in events {
        handle.deliver(event).await?;
    }
    info!(events = count, "events delivered");

    for session_id in &args.select {
        handle.select_session(session_id).await?;
        wait_for_history(&handle, session_id).await?;
    }

    let mut sessions = Vec::new();
    for session_id in &session_ids {
        if let Some(view) = handle.view(session_id).await? {
            sessions.push(view);
        }
    }
    let stats = handle.stats().await?;

    drop(handle);
    task.await.context("memory service panicked")?;

    Ok(ReplayReport {
        events: count,
        sessions,
        stats,
    })
}

fn read_events(path: &Path) -> anyhow::Result<Vec<TransportEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading events file {}", path.display()))?;
    parse_events(&text).with_context(|| format!("parsing events file {}", path.display()))
}

async fn wait_for_history(handle: &MemoryHandle, session_id: &str) -> anyhow::Result<()> {
    let wait = async {
        loop {
            match handle.view(session_id).await? {
                Some(view) if view.history_loading.is_none() => return anyhow::Ok(()),
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    };
    match tokio::time::timeout(LOAD_WAIT, wait).await {
        Ok(result) => result,
        Err(_) => bail!(
            "history for {session_id} did not load within {}",
            humantime::format_duration(LOAD_WAIT)
        ),
    }
}

pub fn print_text(report: &ReplayReport) {
    println!("events: {}", report.events);
    for view in &report.sessions {
        let flags = [
            (view.is_streaming, "streaming"),
            (view.has_more_above, "more-above"),
            (view.has_more_below, "more-below"),
            (view.load_failed, "load-failed"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",");
        println!("{}  messages={}  [{}]", view.session_id, view.messages.len(), flags);
        for message in &view.messages {
            debug!(session_id = %view.session_id, message_id = %message.id, "retained");
            let text = message.text();
            let first_line = text.lines().next().unwrap_or_default();
            println!("  {:>6} {:<9} {}", message.order, message.role.to_string(), first_line);
        }
    }
    let s = &report.stats;
    println!(
        "sessions={} hot={} zombies={} buffered={} paused={} timers={}",
        s.sessions, s.hot_sessions, s.zombies, s.buffered_messages, s.paused, s.pending_timers
    );
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(events: &Path) -> ReplayArgs {
        ReplayArgs {
            events: events.to_path_buf(),
            history: None,
            select: Vec::new(),
            limit: None,
            max_sessions: None,
            zombie_timeout: None,
            json: false,
        }
    }

    #[test]
    fn parse_events_skips_comments_and_blanks() {
        let text = r#"
# captured from a dev backend
{"event":"status-change","session_id":"s1","status":{"type":"busy"}}

{"event":"status-change","session_id":"s1","status":{"type":"idle"}}
"#;
        assert_eq!(parse_events(text).unwrap().len(), 2);
    }

    #[test]
    fn parse_events_reports_line_number() {
        let err = parse_events("{\"event\":\"status-change\"}\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn overrides_are_validated() {
        let mut config = Config::default();
        let mut a = args(Path::new("e.jsonl"));
        a.limit = Some(0);
        assert!(apply_overrides(&mut config, &a).is_err());

        let mut config = Config::default();
        a.limit = Some(40);
        a.zombie_timeout = Some(Duration::from_secs(90));
        apply_overrides(&mut config, &a).unwrap();
        assert_eq!(config.memory.message_limit, 40);
        assert_eq!(config.memory.zombie_timeout_secs, 90);
    }

    #[tokio::test]
    async fn replay_merges_stream_and_history() {
        let mut events = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            events,
            r#"{{"event":"message-part","session_id":"s1","message_id":"m3","role":"assistant","order":3,"part":{{"id":"p0","type":"text","text":"Hel"}}}}"#
        )
        .unwrap();
        writeln!(
            events,
            r#"{{"event":"message-part","session_id":"s1","message_id":"m3","role":"assistant","order":3,"part":{{"id":"p0","type":"text","text":"Hello"}}}}"#
        )
        .unwrap();
        let mut history = tempfile::NamedTempFile::new().unwrap();
        writeln!(history, r#"{{"session_id":"s1","id":"m1","role":"user","order":1,"parts":[]}}"#).unwrap();
        writeln!(history, r#"{{"session_id":"s1","id":"m2","role":"assistant","order":2,"parts":[]}}"#).unwrap();

        let mut a = args(events.path());
        a.history = Some(history.path().to_path_buf());
        a.select = vec!["s1".into()];
        let report = run(Config::default(), &a).await.unwrap();

        assert_eq!(report.events, 2);
        let view = &report.sessions[0];
        let ids: Vec<_> = view.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(view.messages[2].text(), "Hello");
        assert_eq!(report.stats.hot_sessions, 1);
    }
}
