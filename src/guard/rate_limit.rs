//! Sliding upload windows per identity

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::fixes::Timestamp;
use crate::state::Document;

/// Upload ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_hour: usize,
    pub per_day: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_hour: 20,
            per_day: 100,
        }
    }
}

/// Admitted-upload timestamps, keyed by owner id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindows {
    #[serde(default)]
    pub windows: BTreeMap<String, Vec<Timestamp>>,
}

impl Document for RateWindows {
    const NAME: &'static str = "rate_windows";
}

impl RateWindows {
    /// Drop entries older than 24h for one identity
    pub fn prune(&mut self, owner_id: &str, now: Timestamp) {
        let cutoff = now - Duration::hours(24);
        if let Some(window) = self.windows.get_mut(owner_id) {
            window.retain(|ts| *ts > cutoff);
            if window.is_empty() {
                self.windows.remove(owner_id);
            }
        }
    }

    /// Prune every identity; returns how many timestamps were dropped
    pub fn prune_all(&mut self, now: Timestamp) -> usize {
        let cutoff = now - Duration::hours(24);
        let mut dropped = 0;
        for window in self.windows.values_mut() {
            let before = window.len();
            window.retain(|ts| *ts > cutoff);
            dropped += before - window.len();
        }
        self.windows.retain(|_, w| !w.is_empty());
        dropped
    }

    /// Uploads in the trailing hour and trailing day
    pub fn counts(&self, owner_id: &str, now: Timestamp) -> (usize, usize) {
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);
        match self.windows.get(owner_id) {
            Some(window) => (
                window.iter().filter(|ts| **ts > hour_ago).count(),
                window.iter().filter(|ts| **ts > day_ago).count(),
            ),
            None => (0, 0),
        }
    }

    /// Reason the next upload would break a limit, if it would
    pub fn violation(&self, owner_id: &str, limits: RateLimits, now: Timestamp) -> Option<String> {
        let (hour, day) = self.counts(owner_id, now);
        if hour >= limits.per_hour {
            Some(format!(
                "{} uploads in the last hour (limit {})",
                hour, limits.per_hour
            ))
        } else if day >= limits.per_day {
            Some(format!(
                "{} uploads in the last 24h (limit {})",
                day, limits.per_day
            ))
        } else {
            None
        }
    }

    pub fn record(&mut self, owner_id: &str, now: Timestamp) {
        self.windows.entry(owner_id.to_string()).or_default().push(now);
    }
}
