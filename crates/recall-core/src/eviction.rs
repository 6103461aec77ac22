// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounds the number of hot (materialized) sessions.
//!
//! Recency is tracked in an unbounded [`lru::LruCache`]; capacity is enforced
//! by [`EvictionPolicy::select_victims`] rather than by the cache itself,
//! because some sessions (the current one, streaming ones) must never be
//! dropped implicitly.
use std::collections::HashSet;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use recall_model::SessionId;

pub struct EvictionPolicy {
    hot: LruCache<SessionId, Instant>,
    zombies: HashSet<SessionId>,
    max_sessions: usize,
    zombie_timeout: Duration,
}

impl EvictionPolicy {
    pub fn new(max_sessions: usize, zombie_timeout: Duration) -> Self {
        Self {
            hot: LruCache::unbounded(),
            zombies: HashSet::new(),
            max_sessions: max_sessions.max(1),
            zombie_timeout,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn len(&self) -> usize {
        self.hot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }

    pub fn is_hot(&self, id: &str) -> bool {
        self.hot.contains(id)
    }

    pub fn is_zombie(&self, id: &str) -> bool {
        self.zombies.contains(id)
    }

    pub fn last_accessed(&self, id: &str) -> Option<Instant> {
        self.hot.peek(id).copied()
    }

    /// Record an access; makes the session hot and clears its zombie mark.
    pub fn touch(&mut self, id: &str, now: Instant) {
        self.hot.put(id.to_string(), now);
        if self.zombies.remove(id) {
            debug!(session_id = id, "zombie revived");
        }
    }

    /// Hot sessions, most recently accessed first.
    pub fn hot_sessions(&self) -> Vec<SessionId> {
        self.hot.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Mark hot sessions idle for at least the zombie timeout.  Returns the
    /// newly marked ids.
    pub fn mark_zombies(&mut self, now: Instant) -> Vec<SessionId> {
        let mut marked = Vec::new();
        for (id, at) in self.hot.iter() {
            if now.duration_since(*at) >= self.zombie_timeout && !self.zombies.contains(id) {
                marked.push(id.clone());
            }
        }
        for id in &marked {
            debug!(session_id = %id, "session marked zombie");
            self.zombies.insert(id.clone());
        }
        marked
    }

    /// Sessions to evict to get back under the cap: zombies first (oldest
    /// first), then least recently accessed.  `current` and pinned sessions
    /// are never selected; if not enough candidates remain the hot set stays
    /// over the cap.
    pub fn select_victims(&self, current: Option<&str>, is_pinned: impl Fn(&str) -> bool) -> Vec<SessionId> {
        let excess = self.hot.len().saturating_sub(self.max_sessions);
        if excess == 0 {
            return Vec::new();
        }

        let evictable = |id: &str| Some(id) != current && !is_pinned(id);

        let mut zombies: Vec<(Instant, &SessionId)> = self
            .hot
            .iter()
            .filter(|(id, _)| self.zombies.contains(*id))
            .map(|(id, at)| (*at, id))
            .collect();
        zombies.sort();

        let zombie_ids = zombies.into_iter().map(|(_, id)| id);
        // `iter()` runs most → least recent; reversed it is LRU order.
        let lru_ids = self.hot.iter().rev().map(|(id, _)| id).filter(|id| !self.zombies.contains(*id));

        let victims: Vec<SessionId> = zombie_ids
            .chain(lru_ids)
            .filter(|id| evictable(id))
            .take(excess)
            .cloned()
            .collect();

        if victims.len() < excess {
            warn!(
                hot = self.hot.len(),
                max_sessions = self.max_sessions,
                "hot set over capacity, every remaining session is pinned"
            );
        }
        victims
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.zombies.remove(id);
        self.hot.pop(id).is_some()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn under_cap_selects_nothing() {
        let mut p = EvictionPolicy::new(3, secs(60));
        let t0 = Instant::now();
        p.touch("a", t0);
        p.touch("b", t0);
        assert!(p.select_victims(None, |_| false).is_empty());
    }

    #[test]
    fn least_recently_accessed_goes_first() {
        let mut p = EvictionPolicy::new(2, secs(600));
        let t0 = Instant::now();
        p.touch("a", t0);
        p.touch("b", t0 + secs(1));
        p.touch("c", t0 + secs(2));
        p.touch("a", t0 + secs(3));
        assert_eq!(p.select_victims(None, |_| false), ["b"]);
        assert_eq!(p.hot_sessions(), ["a", "c", "b"]);
    }

    #[test]
    fn zombies_are_evicted_before_lru_candidates() {
        let mut p = EvictionPolicy::new(2, secs(60));
        let t0 = Instant::now();
        // "lru" sits at the cold end of the recency list but is not idle
        // long enough to be a zombie.
        p.touch("lru", t0 + secs(50));
        p.touch("zombie", t0);
        p.touch("fresh", t0 + secs(55));
        let marked = p.mark_zombies(t0 + secs(61));
        assert_eq!(marked, ["zombie"]);
        assert_eq!(p.select_victims(None, |_| false), ["zombie"]);
    }

    #[test]
    fn current_and_pinned_sessions_are_never_selected() {
        let mut p = EvictionPolicy::new(1, secs(60));
        let t0 = Instant::now();
        p.touch("cur", t0);
        p.touch("stream", t0 + secs(1));
        p.touch("idle", t0 + secs(2));
        let victims = p.select_victims(Some("cur"), |id| id == "stream");
        assert_eq!(victims, ["idle"]);
    }

    #[test]
    fn all_pinned_allows_overflow() {
        let mut p = EvictionPolicy::new(1, secs(60));
        let t0 = Instant::now();
        p.touch("a", t0);
        p.touch("b", t0);
        assert!(p.select_victims(Some("a"), |_| true).is_empty());
    }

    #[test]
    fn touch_clears_zombie_mark() {
        let mut p = EvictionPolicy::new(5, secs(10));
        let t0 = Instant::now();
        p.touch("a", t0);
        p.mark_zombies(t0 + secs(10));
        assert!(p.is_zombie("a"));
        p.touch("a", t0 + secs(11));
        assert!(!p.is_zombie("a"));
        assert!(p.mark_zombies(t0 + secs(12)).is_empty());
    }

    #[test]
    fn remove_drops_hot_entry_and_mark() {
        let mut p = EvictionPolicy::new(5, secs(10));
        let t0 = Instant::now();
        p.touch("a", t0);
        p.mark_zombies(t0 + secs(20));
        assert!(p.remove("a"));
        assert!(!p.is_hot("a"));
        assert!(!p.is_zombie("a"));
        assert!(!p.remove("a"));
    }
}
