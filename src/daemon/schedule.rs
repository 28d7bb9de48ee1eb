//! Scheduled jobs and their periods

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    Pull,
    Push,
    Autofix,
    DictionaryCleanup,
    Reorganize,
    BranchScan,
    Dedup,
    Compaction,
}

impl Job {
    pub const ALL: [Job; 8] = [
        Job::Pull,
        Job::Push,
        Job::Autofix,
        Job::DictionaryCleanup,
        Job::Reorganize,
        Job::BranchScan,
        Job::Dedup,
        Job::Compaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Pull => "pull",
            Job::Push => "push",
            Job::Autofix => "autofix",
            Job::DictionaryCleanup => "dictionary_cleanup",
            Job::Reorganize => "reorganize",
            Job::BranchScan => "branch_scan",
            Job::Dedup => "dedup",
            Job::Compaction => "compaction",
        }
    }

    /// Timer period from configuration (never zero)
    pub fn period(&self, config: &Config) -> Duration {
        let m = &config.maintenance;
        let secs = match self {
            Job::Pull => config.sync.pull_interval_secs,
            Job::Push => config.sync.push_interval_secs,
            Job::Autofix => m.autofix_interval_secs,
            Job::DictionaryCleanup => m.dictionary_cleanup_interval_secs,
            Job::Reorganize => m.reorganize_interval_secs,
            Job::BranchScan => m.branch_scan_interval_secs,
            Job::Dedup => m.dedup_interval_secs,
            Job::Compaction => m.compaction_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Shortest configured period; drives the liveness check
    pub fn shortest_period(config: &Config) -> Duration {
        Job::ALL
            .iter()
            .map(|job| job.period(config))
            .min()
            .unwrap_or(Duration::from_secs(1))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Job::ALL
            .iter()
            .copied()
            .find(|job| job.as_str() == normalized)
            .ok_or_else(|| {
                let names: Vec<_> = Job::ALL.iter().map(Job::as_str).collect();
                format!("unknown job '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}
