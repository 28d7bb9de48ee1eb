//! Relevance scoring
//!
//! Two scores live here:
//! - the stored `relevance_score` of a fix, recomputed on every usage report
//! - the query-time search score, blending text similarity with success rate

use std::collections::BTreeSet;

use super::model::{FixRecord, Timestamp, UsageStats};

/// Success prior for fixes that were never attempted
pub const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

/// Weighted blend stored on each fix:
/// `0.5·successRate + 0.2·min(attempts/10, 1) + 0.2·recency + 0.1·(¬quarantined)`
pub fn relevance_score(
    usage: &UsageStats,
    created_at: Timestamp,
    quarantined: bool,
    now: Timestamp,
) -> f64 {
    let volume = (usage.attempts as f64 / 10.0).min(1.0);
    let trust = if quarantined { 0.0 } else { 1.0 };
    0.5 * usage.success_rate() + 0.2 * volume + 0.2 * recency(created_at, now) + 0.1 * trust
}

/// Linear decay over a year, clamped to [0, 1]
pub fn recency(created_at: Timestamp, now: Timestamp) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / 365.0).clamp(0.0, 1.0)
}

/// Recompute and store the relevance score of a record
pub fn rescore(record: &mut FixRecord, now: Timestamp) {
    record.relevance_score =
        relevance_score(&record.usage, record.created_at, record.quarantined, now);
}

/// Sørensen–Dice overlap of two token sets
pub fn similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    2.0 * shared / (a.len() + b.len()) as f64
}

/// Query-time score; never exceeds the text similarity itself.
pub fn search_score(similarity: f64, success_rate: Option<f64>) -> f64 {
    let rate = success_rate.unwrap_or(NEUTRAL_SUCCESS_RATE).clamp(0.0, 1.0);
    similarity * (0.7 + 0.3 * rate)
}
