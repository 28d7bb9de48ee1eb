//! Fix records, remote refs, and the documents that hold them

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Document;

pub type Timestamp = DateTime<Utc>;

/// Opaque key/value bag attached to a fix
pub type FixContext = BTreeMap<String, serde_json::Value>;

/// Context key marking a fix as only meaningful inside one project
pub const PROJECT_SPECIFIC_KEY: &str = "project_specific";

/// Attempt/success counters for a fix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub attempts: u64,
    pub successes: u64,
}

impl UsageStats {
    /// Fraction of attempts that succeeded (0 when never attempted)
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }
}

/// A fix folded into another one by the merge pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFix {
    pub fix_hash: String,
    pub owner_id: String,
    pub merged_at: Timestamp,
}

/// Parent/child relationship plus merge history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Parent fix this one was derived from
    #[serde(default)]
    pub inspired_by: Option<String>,
    #[serde(default)]
    pub variation_reason: Option<String>,
    /// Duplicates collapsed into this fix
    #[serde(default)]
    pub merged_from: Vec<MergedFix>,
}

/// Audit trail for a quarantine decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineMark {
    pub by: String,
    pub reason: String,
    pub at: Timestamp,
}

/// One proposed solution to one error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub fix_hash: String,
    pub error_type: String,
    pub error_signature: String,
    pub solution: String,
    #[serde(default)]
    pub context: FixContext,
    pub owner_id: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub last_used: Option<Timestamp>,
    #[serde(default)]
    pub usage: UsageStats,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub quarantine: Option<QuarantineMark>,
}

impl FixRecord {
    /// Quality on the 0-10 scale used by the promotion bar
    pub fn quality(&self) -> f64 {
        self.relevance_score * 10.0
    }

    pub fn is_project_specific(&self) -> bool {
        self.context
            .get(PROJECT_SPECIFIC_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Public, anonymized pointer to a shared fix artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub fix_hash: String,
    pub owner_id: String,
    pub error_type: String,
    /// Normalized signature, used for ranking and grouping
    #[serde(default)]
    pub error_signature: String,
    pub timestamp: Timestamp,
    /// Path of the encrypted artifact inside the repository
    pub artifact: String,
    /// Path of the detached signature inside the repository
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub usage_count: Option<u64>,
    #[serde(default)]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub quarantine: Option<QuarantineMark>,
    #[serde(default)]
    pub merged_from: Vec<MergedFix>,
}

impl RemoteRef {
    /// Same publication (hash and publisher)
    pub fn same_entry(&self, other: &RemoteRef) -> bool {
        self.fix_hash == other.fix_hash && self.owner_id == other.owner_id
    }
}

/// Where a ranked candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixSource {
    Local,
    Remote,
}

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFix {
    pub fix_hash: String,
    pub error_type: String,
    pub error_signature: String,
    /// Plaintext solution, only known for local fixes
    pub solution: Option<String>,
    pub owner_id: String,
    pub score: f64,
    pub attempts: u64,
    pub timestamp: Timestamp,
    pub source: FixSource,
}

/// Local fix dictionary: normalized signature -> fixes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixDictionary {
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<FixRecord>>,
    /// Fixes removed by the merge pass, recoverable by hash
    #[serde(default)]
    pub archived: BTreeMap<String, FixRecord>,
}

impl Document for FixDictionary {
    const NAME: &'static str = "fix_dictionary";
}

impl FixDictionary {
    pub fn find(&self, fix_hash: &str) -> Option<&FixRecord> {
        self.entries
            .values()
            .flat_map(|records| records.iter())
            .find(|r| r.fix_hash == fix_hash)
    }

    pub fn find_mut(&mut self, fix_hash: &str) -> Option<&mut FixRecord> {
        self.entries
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.fix_hash == fix_hash)
    }

    pub fn records(&self) -> impl Iterator<Item = &FixRecord> {
        self.entries.values().flat_map(|records| records.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read cache of the public index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteCache {
    #[serde(default)]
    pub refs: Vec<RemoteRef>,
    #[serde(default)]
    pub last_sync: Option<Timestamp>,
}

impl Document for RemoteCache {
    const NAME: &'static str = "remote_cache";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut usage = UsageStats::default();
        assert_eq!(usage.success_rate(), 0.0);
        usage.record(true);
        usage.record(false);
        assert_eq!(usage.attempts, 2);
        assert_eq!(usage.successes, 1);
        assert!((usage.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remote_ref_defaults_for_missing_fields() {
        let json = r#"{
            "fix_hash": "abc",
            "owner_id": "cid-1",
            "error_type": "NameError",
            "timestamp": "2026-01-01T00:00:00Z",
            "artifact": "fixes/abc.enc"
        }"#;
        let r: RemoteRef = serde_json::from_str(json).unwrap();
        assert!(!r.quarantined);
        assert!(r.success_rate.is_none());
        assert!(r.merged_from.is_empty());
    }
}
