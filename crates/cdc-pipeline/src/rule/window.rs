//! Trailing event-time windows for threshold rules.
//!
//! Counts are kept in one-second buckets keyed by the source timestamp, so
//! replaying stored events rebuilds the same state the live stream built.

use std::collections::VecDeque;

use binwatch_core::rule::WindowSpec;
use chrono::{DateTime, Utc};

/// Result of recording one matching event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome {
    /// At or under the threshold.
    Below(u64),
    /// Over the threshold but still cooling down from the last fire.
    Cooling(u64),
    /// Over the threshold; the window has been reset.
    Fired {
        count: u64,
        first_seen: DateTime<Utc>,
    },
}

/// Per-(rule, group key) counter over the last `seconds` seconds.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    /// (unix second, count), oldest first.
    buckets: VecDeque<(i64, u64)>,
    total: u64,
    last_fired: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matching events currently inside the window.
    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Count one event at `at` and decide whether the rule fires.
    ///
    /// Fires when the count exceeds the threshold and at least
    /// `cooldown_secs` of event time passed since the previous fire.
    /// Firing empties the window.
    pub fn record(&mut self, at: DateTime<Utc>, spec: &WindowSpec) -> WindowOutcome {
        let sec = at.timestamp();
        match self.buckets.back_mut() {
            // late timestamps join the newest bucket
            Some((newest, count)) if *newest >= sec => *count += 1,
            _ => self.buckets.push_back((sec, 1)),
        }
        self.total += 1;
        self.last_seen = Some(self.last_seen.map_or(at, |seen| seen.max(at)));
        self.evict(spec.seconds);

        if self.total <= spec.threshold {
            return WindowOutcome::Below(self.total);
        }
        let cooled = self.last_fired.is_none_or(|fired| {
            (at - fired).num_seconds() >= i64::try_from(spec.cooldown_secs).unwrap_or(i64::MAX)
        });
        if !cooled {
            return WindowOutcome::Cooling(self.total);
        }

        let count = self.total;
        let first_seen = self
            .buckets
            .front()
            .and_then(|(sec, _)| DateTime::from_timestamp(*sec, 0))
            .unwrap_or(at);
        self.buckets.clear();
        self.total = 0;
        self.last_fired = Some(at);
        WindowOutcome::Fired { count, first_seen }
    }

    /// Remember a fire that happened before a restart.
    pub fn seed_fired(&mut self, at: DateTime<Utc>) {
        self.last_fired = Some(self.last_fired.map_or(at, |fired| fired.max(at)));
        self.last_seen = Some(self.last_seen.map_or(at, |seen| seen.max(at)));
    }

    /// Whether the window carries nothing that matters at `now`: no counts
    /// left and no cooldown still running.
    pub fn is_idle(&self, now: DateTime<Utc>, spec: &WindowSpec) -> bool {
        let horizon = spec.seconds.max(spec.cooldown_secs);
        let horizon = i64::try_from(horizon).unwrap_or(i64::MAX);
        self.last_seen
            .is_none_or(|seen| (now - seen).num_seconds() >= horizon)
    }

    fn evict(&mut self, seconds: u64) {
        let Some(&(newest, _)) = self.buckets.back() else {
            return;
        };
        let cutoff = newest.saturating_sub(i64::try_from(seconds).unwrap_or(i64::MAX)) + 1;
        while let Some(&(sec, count)) = self.buckets.front() {
            if sec >= cutoff {
                break;
            }
            self.total -= count;
            self.buckets.pop_front();
        }
    }
}
