//! Alert suppression: de-duplication per (rule, key) and a per-rule rate
//! limit.

use std::collections::HashMap;
use std::time::Duration;

use binwatch_core::config::NotifyConfig;
use tokio::time::Instant;

const RATE_PERIOD: Duration = Duration::from_secs(60);

/// Decision for one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Same (rule, key) already delivered inside the suppression window.
    Duplicate,
    /// The rule exceeded its per-minute budget.
    RateLimited,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deliver => "deliver",
            Self::Duplicate => "duplicate",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn is_deliver(self) -> bool {
        self == Self::Deliver
    }
}

/// Tracks recently delivered alerts.
///
/// Only admitted alerts count toward the window and the rate budget, so a
/// burst of identical alerts yields one delivery per window.
pub struct Suppressor {
    window: Duration,
    /// 0 disables the limit.
    rate_limit_per_rule: u32,
    /// (rule_id, key) -> last admitted
    last_seen: HashMap<(String, String), Instant>,
    /// rule_id -> (admitted this period, period start)
    rate: HashMap<String, (u32, Instant)>,
    admitted: u64,
    duplicates: u64,
    rate_limited: u64,
}

impl Suppressor {
    pub fn new(window_secs: u64, rate_limit_per_rule: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            rate_limit_per_rule,
            last_seen: HashMap::new(),
            rate: HashMap::new(),
            admitted: 0,
            duplicates: 0,
            rate_limited: 0,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        Self::new(config.suppression_window_secs, config.rate_limit_per_rule)
    }

    pub fn check(&mut self, rule_id: &str, key: &str) -> Verdict {
        self.check_at(rule_id, key, Instant::now())
    }

    pub fn check_at(&mut self, rule_id: &str, key: &str, now: Instant) -> Verdict {
        let dedup_key = (rule_id.to_owned(), key.to_owned());

        if let Some(last) = self.last_seen.get(&dedup_key)
            && now.saturating_duration_since(*last) < self.window
        {
            self.duplicates += 1;
            tracing::debug!(rule_id, key, "alert suppressed by de-duplication window");
            return Verdict::Duplicate;
        }

        if self.is_rate_limited(rule_id, now) {
            self.rate_limited += 1;
            tracing::debug!(rule_id, "alert suppressed by rate limit");
            return Verdict::RateLimited;
        }

        self.last_seen.insert(dedup_key, now);
        self.bump_rate(rule_id, now);
        self.admitted += 1;
        Verdict::Deliver
    }

    fn is_rate_limited(&self, rule_id: &str, now: Instant) -> bool {
        if self.rate_limit_per_rule == 0 {
            return false;
        }
        match self.rate.get(rule_id) {
            Some((count, start)) if now.saturating_duration_since(*start) < RATE_PERIOD => {
                *count >= self.rate_limit_per_rule
            }
            _ => false,
        }
    }

    fn bump_rate(&mut self, rule_id: &str, now: Instant) {
        let entry = self.rate.entry(rule_id.to_owned()).or_insert((0, now));
        if now.saturating_duration_since(entry.1) >= RATE_PERIOD {
            *entry = (1, now);
        } else {
            entry.0 += 1;
        }
    }

    /// Forget entries that can no longer suppress anything.
    pub fn cleanup_expired(&mut self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&mut self, now: Instant) {
        let window = self.window;
        self.last_seen
            .retain(|_, last| now.saturating_duration_since(*last) < window);
        self.rate
            .retain(|_, (_, start)| now.saturating_duration_since(*start) < RATE_PERIOD);
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_seen.len()
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_alert_is_delivered() {
        let mut s = Suppressor::new(300, 30);
        assert_eq!(s.check("r1", "shop.orders"), Verdict::Deliver);
        assert_eq!(s.admitted(), 1);
    }

    #[test]
    fn same_rule_and_key_is_suppressed_inside_window() {
        let mut s = Suppressor::new(300, 30);
        let t0 = Instant::now();
        assert!(s.check_at("r1", "k", t0).is_deliver());
        assert_eq!(
            s.check_at("r1", "k", t0 + Duration::from_secs(299)),
            Verdict::Duplicate
        );
        assert!(s.check_at("r1", "k", t0 + Duration::from_secs(300)).is_deliver());
        assert_eq!(s.duplicates(), 1);
    }

    #[test]
    fn keys_and_rules_are_independent() {
        let mut s = Suppressor::new(300, 30);
        let t0 = Instant::now();
        assert!(s.check_at("r1", "a", t0).is_deliver());
        assert!(s.check_at("r1", "b", t0).is_deliver());
        assert!(s.check_at("r2", "a", t0).is_deliver());
        assert_eq!(s.check_at("r2", "a", t0), Verdict::Duplicate);
        assert_eq!(s.tracked_keys(), 3);
    }

    #[test]
    fn zero_window_disables_dedup() {
        let mut s = Suppressor::new(0, 0);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(s.check_at("r1", "k", t0).is_deliver());
        }
        assert_eq!(s.duplicates(), 0);
    }

    #[test]
    fn rate_limit_applies_per_rule_per_minute() {
        let mut s = Suppressor::new(0, 2);
        let t0 = Instant::now();
        assert!(s.check_at("r1", "a", t0).is_deliver());
        assert!(s.check_at("r1", "b", t0).is_deliver());
        assert_eq!(s.check_at("r1", "c", t0), Verdict::RateLimited);
        assert!(s.check_at("r2", "c", t0).is_deliver());
        assert!(
            s.check_at("r1", "c", t0 + Duration::from_secs(60))
                .is_deliver()
        );
        assert_eq!(s.rate_limited(), 1);
    }

    #[test]
    fn suppressed_alerts_do_not_extend_the_window() {
        let mut s = Suppressor::new(10, 0);
        let t0 = Instant::now();
        assert!(s.check_at("r1", "k", t0).is_deliver());
        assert!(!s.check_at("r1", "k", t0 + Duration::from_secs(9)).is_deliver());
        assert!(s.check_at("r1", "k", t0 + Duration::from_secs(10)).is_deliver());
    }

    #[test]
    fn cleanup_drops_expired_entries() {
        let mut s = Suppressor::new(10, 5);
        let t0 = Instant::now();
        s.check_at("r1", "old", t0);
        s.check_at("r1", "new", t0 + Duration::from_secs(8));
        s.cleanup_at(t0 + Duration::from_secs(12));
        assert_eq!(s.tracked_keys(), 1);
        s.cleanup_at(t0 + Duration::from_secs(120));
        assert_eq!(s.tracked_keys(), 0);
    }

    #[test]
    fn unicode_and_long_identifiers() {
        let mut s = Suppressor::new(60, 10);
        let long = "x".repeat(10_000);
        assert!(s.check("rule_日本語", &long).is_deliver());
        assert!(!s.check("rule_日本語", &long).is_deliver());
    }
}
