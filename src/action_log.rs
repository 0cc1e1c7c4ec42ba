//! Rate-limited action log
//!
//! Remembers when an action was last taken for a key and answers "would
//! acting now repeat a recent action?". Both synchronization directions keep
//! one of these so that a change notification caused by our own command on
//! the peer control plane is not forwarded back again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Two actions for the same key closer together than this are treated as an
/// echo of one another.
pub const CONSECUTIVE_ACTION_THRESHOLD: Duration = Duration::from_secs(3);

/// The whole log is discarded once it has been idle for this long.
pub const MAX_LOG_LENGTH: Duration = Duration::from_secs(60);

/// Per-key record of recent action timestamps.
pub struct ActionLog {
    threshold: Duration,
    max_length: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Vec<Instant>>,
    last_update: Option<Instant>,
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new(CONSECUTIVE_ACTION_THRESHOLD, MAX_LOG_LENGTH)
    }
}

impl ActionLog {
    pub fn new(threshold: Duration, max_length: Duration) -> Self {
        Self {
            threshold,
            max_length,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append "now" to the key's history.
    pub fn record(&self, key: &str) {
        let now = Instant::now();
        self.locked().push(key, now, self.max_length);
    }

    /// Record the action and report whether it violates the consecutive
    /// action threshold. Record and compare happen under one lock.
    pub fn violated(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.locked();
        inner.push(key, now, self.max_length);
        match inner.prev(key) {
            Some(prev) => now.duration_since(prev) <= self.threshold,
            None => false,
        }
    }

    /// Most recent timestamp for the key.
    pub fn last(&self, key: &str) -> Option<Instant> {
        self.locked()
            .entries
            .get(key)
            .and_then(|stamps| stamps.last().copied())
    }

    /// Second most recent timestamp for the key.
    pub fn prev(&self, key: &str) -> Option<Instant> {
        self.locked().prev(key)
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn push(&mut self, key: &str, now: Instant, max_length: Duration) {
        if let Some(last) = self.last_update {
            if now.duration_since(last) > max_length {
                self.entries.clear();
            }
        }
        self.last_update = Some(now);
        self.entries.entry(key.to_string()).or_default().push(now);
    }

    fn prev(&self, key: &str) -> Option<Instant> {
        let stamps = self.entries.get(key)?;
        if stamps.len() < 2 {
            return None;
        }
        Some(stamps[stamps.len() - 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn quick_log() -> ActionLog {
        ActionLog::new(Duration::from_millis(50), Duration::from_millis(500))
    }

    #[test]
    fn test_empty_log() {
        let log = quick_log();
        assert!(log.last("alpha").is_none());
        assert!(log.prev("alpha").is_none());
    }

    #[test]
    fn test_single_record_never_violates() {
        let log = quick_log();
        assert!(!log.violated("alpha"));
    }

    #[test]
    fn test_rapid_repeat_violates() {
        let log = quick_log();
        log.record("alpha");
        assert!(log.violated("alpha"));
    }

    #[test]
    fn test_violation_tracks_two_most_recent_records() {
        let log = quick_log();
        log.record("alpha");
        sleep(Duration::from_millis(70));
        // First record is out of the window by now, so no violation...
        assert!(!log.violated("alpha"));
        // ...but the check itself recorded, so an immediate repeat is one.
        assert!(log.violated("alpha"));
    }

    #[test]
    fn test_keys_are_independent() {
        let log = quick_log();
        log.record("alpha");
        assert!(!log.violated("bravo"));
        assert!(log.violated("alpha"));
    }

    #[test]
    fn test_last_and_prev_ordering() {
        let log = quick_log();
        log.record("alpha");
        log.record("alpha");
        let last = log.last("alpha").unwrap();
        let prev = log.prev("alpha").unwrap();
        assert!(prev <= last);
    }

    #[test]
    fn test_prev_requires_two_records() {
        let log = quick_log();
        log.record("alpha");
        assert!(log.last("alpha").is_some());
        assert!(log.prev("alpha").is_none());
    }

    #[test]
    fn test_idle_log_is_cleared() {
        let log = quick_log();
        log.record("alpha");
        log.record("alpha");
        sleep(Duration::from_millis(600));
        // The write after the idle gap clears everything recorded before it.
        log.record("bravo");
        assert!(log.last("alpha").is_none());
        assert!(log.last("bravo").is_some());
    }
}
