//! Local -> global promotion
//!
//! Two gates run before anything leaves the machine:
//! - `PromotionCriteria` - the fixed quality/usage/success bar
//! - `PublishFilter` - a smart filter deciding whether the fix adds anything

use crate::config::PublishConfig;
use crate::fixes::normalize::signature_key;
use crate::fixes::{FixRecord, RemoteRef};

/// Bar a local fix has to clear to be published
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionCriteria {
    pub min_quality: f64,
    pub min_usage: u64,
    pub min_success_rate: f64,
}

impl Default for PromotionCriteria {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

impl From<&PublishConfig> for PromotionCriteria {
    fn from(config: &PublishConfig) -> Self {
        Self {
            min_quality: config.min_quality,
            min_usage: config.min_usage,
            min_success_rate: config.min_success_rate,
        }
    }
}

impl PromotionCriteria {
    /// Why the record stays local, or `None` when it qualifies
    pub fn shortfall(&self, record: &FixRecord) -> Option<String> {
        if record.quarantined {
            return Some("fix is quarantined".to_string());
        }
        if record.is_project_specific() {
            return Some("fix is project-specific".to_string());
        }
        if record.quality() < self.min_quality {
            return Some(format!(
                "quality {:.1} below {:.1}",
                record.quality(),
                self.min_quality
            ));
        }
        if record.usage.attempts < self.min_usage {
            return Some(format!(
                "used {} times, needs {}",
                record.usage.attempts, self.min_usage
            ));
        }
        let rate = record.usage.success_rate();
        if rate < self.min_success_rate {
            return Some(format!(
                "success rate {:.2} below {:.2}",
                rate, self.min_success_rate
            ));
        }
        None
    }
}

/// Decides whether a qualifying fix is worth publishing at all
pub trait PublishFilter: Send + Sync {
    /// Reason to keep the fix local-only, or `None` to publish
    fn keep_local(&self, record: &FixRecord, index: &[RemoteRef]) -> Option<String>;
}

/// Skips fixes the public index already covers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoveltyFilter;

impl PublishFilter for NoveltyFilter {
    fn keep_local(&self, record: &FixRecord, index: &[RemoteRef]) -> Option<String> {
        if index.iter().any(|r| r.fix_hash == record.fix_hash) {
            return Some("already published".to_string());
        }

        let key = signature_key(&record.error_signature);
        let quality = record.quality();
        index
            .iter()
            .filter(|r| !r.quarantined && r.error_signature == key)
            .find(|r| r.quality_score.is_some_and(|q| q >= quality))
            .map(|r| format!("equal or better fix {} already published", r.fix_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::{FixContext, Lineage, UsageStats};
    use chrono::Utc;

    fn record(attempts: u64, successes: u64, relevance: f64) -> FixRecord {
        FixRecord {
            fix_hash: "h1".to_string(),
            error_type: "NameError".to_string(),
            error_signature: "NameError: name 'os' is not defined".to_string(),
            solution: "import os".to_string(),
            context: FixContext::new(),
            owner_id: "cid-a".to_string(),
            created_at: Utc::now(),
            last_used: None,
            usage: UsageStats { attempts, successes },
            relevance_score: relevance,
            lineage: Lineage::default(),
            quarantined: false,
            quarantine: None,
        }
    }

    fn published(hash: &str, quality: Option<f64>) -> RemoteRef {
        RemoteRef {
            fix_hash: hash.to_string(),
            owner_id: "cid-b".to_string(),
            error_type: "NameError".to_string(),
            error_signature: signature_key("NameError: name 'os' is not defined"),
            timestamp: Utc::now(),
            artifact: String::new(),
            signature: String::new(),
            quality_score: quality,
            usage_count: None,
            success_rate: None,
            quarantined: false,
            quarantine: None,
            merged_from: Vec::new(),
        }
    }

    #[test]
    fn test_promotion_bar() {
        let criteria = PromotionCriteria::default();
        assert!(criteria.shortfall(&record(25, 25, 1.0)).is_none());
        assert!(criteria.shortfall(&record(24, 24, 1.0)).unwrap().contains("needs 25"));
        assert!(criteria.shortfall(&record(25, 20, 1.0)).unwrap().contains("success rate"));
        assert!(criteria.shortfall(&record(25, 25, 0.79)).unwrap().contains("quality"));

        let mut local = record(30, 30, 1.0);
        local.context.insert("project_specific".to_string(), true.into());
        assert!(criteria.shortfall(&local).unwrap().contains("project-specific"));
    }

    #[test]
    fn test_novelty_filter() {
        let filter = NoveltyFilter;
        let fix = record(30, 30, 0.9);

        assert!(filter.keep_local(&fix, &[]).is_none());
        assert!(filter.keep_local(&fix, &[published("h1", None)]).is_some());
        assert!(filter.keep_local(&fix, &[published("h2", Some(9.5))]).is_some());
        assert!(filter.keep_local(&fix, &[published("h2", Some(5.0))]).is_none());

        let mut quarantined = published("h2", Some(9.5));
        quarantined.quarantined = true;
        assert!(filter.keep_local(&fix, &[quarantined]).is_none());
    }
}
