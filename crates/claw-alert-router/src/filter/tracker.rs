//! Deduplication and rate-limit state.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::AlertStatus;

/// Identity of a delivery for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
    pub(crate) target: String,
    pub(crate) fingerprint: String,
    pub(crate) status: AlertStatus,
}

/// Remembers when each delivery was last allowed.
#[derive(Debug)]
pub(crate) struct DedupTracker {
    window: Duration,
    seen: HashMap<DedupKey, Instant>,
}

impl DedupTracker {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Sweeps expired entries, then reports whether the key is still inside its window.
    pub(crate) fn is_duplicate(&mut self, key: &DedupKey, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
        self.seen.contains_key(key)
    }

    pub(crate) fn record(&mut self, key: DedupKey, now: Instant) {
        self.seen.insert(key, now);
    }

    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Per-target counters bucketed by minute.
#[derive(Debug, Default)]
struct TargetWindow {
    start_minute: u64,
    buckets: BTreeMap<u64, u32>,
}

impl TargetWindow {
    fn total(&self) -> u32 {
        self.buckets.values().sum()
    }
}

/// Counts deliveries per target over a window of whole minutes.
///
/// Minutes are measured from the tracker's creation. A window is discarded
/// wholesale once its first minute is `window_minutes` old.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    max: u32,
    window_minutes: u64,
    epoch: Instant,
    windows: HashMap<String, TargetWindow>,
}

impl RateLimiter {
    pub(crate) fn new(max: u32, window_minutes: u64) -> Self {
        Self {
            max,
            window_minutes,
            epoch: Instant::now(),
            windows: HashMap::new(),
        }
    }

    fn minute(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs() / 60
    }

    fn current_window(&mut self, target: &str, now: Instant) -> &mut TargetWindow {
        let minute = self.minute(now);
        let window_minutes = self.window_minutes;
        let window = self
            .windows
            .entry(target.to_string())
            .or_insert_with(|| TargetWindow {
                start_minute: minute,
                buckets: BTreeMap::new(),
            });
        if minute.saturating_sub(window.start_minute) >= window_minutes {
            window.start_minute = minute;
            window.buckets.clear();
        }
        window
    }

    pub(crate) fn is_limited(&mut self, target: &str, now: Instant) -> bool {
        let max = self.max;
        self.current_window(target, now).total() >= max
    }

    pub(crate) fn record(&mut self, target: &str, now: Instant) {
        let minute = self.minute(now);
        *self
            .current_window(target, now)
            .buckets
            .entry(minute)
            .or_insert(0) += 1;
    }

    pub(crate) fn count(&self, target: &str) -> u32 {
        self.windows.get(target).map_or(0, TargetWindow::total)
    }

    pub(crate) fn clear(&mut self) {
        self.windows.clear();
    }
}
