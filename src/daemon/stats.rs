//! Persisted daemon statistics

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::maintenance::IdentityClass;
use crate::fixes::Timestamp;
use crate::state::Document;

/// Last run of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub at: Timestamp,
    pub ok: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStats {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub heartbeat: Option<Timestamp>,

    #[serde(default)]
    pub pulls: u64,
    #[serde(default)]
    pub pushes: u64,
    #[serde(default)]
    pub conflicts_resolved: u64,
    #[serde(default)]
    pub failed_cycles: u64,

    #[serde(default)]
    pub fixes_merged: u64,
    #[serde(default)]
    pub refs_merged: u64,
    #[serde(default)]
    pub refs_cleaned: u64,

    /// Branches found stale by the last scan
    #[serde(default)]
    pub stale_branches: Vec<String>,
    /// Output of the last reorganize pass, by owner
    #[serde(default)]
    pub identity_classes: BTreeMap<String, IdentityClass>,

    #[serde(default)]
    pub last_runs: BTreeMap<String, JobRun>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Document for DaemonStats {
    const NAME: &'static str = "daemon_stats";
}

impl DaemonStats {
    /// Running flag set and heartbeat fresher than twice the shortest timer
    pub fn is_alive(&self, now: Timestamp, shortest_period: Duration) -> bool {
        let Some(heartbeat) = self.heartbeat else {
            return false;
        };
        let window = chrono::Duration::from_std(shortest_period * 2)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.running && now - heartbeat <= window
    }

    pub fn record_run(&mut self, job: &str, run: JobRun) {
        if run.ok {
            self.last_error = None;
        }
        self.last_runs.insert(job.to_string(), run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_liveness() {
        let now = Utc::now();
        let period = Duration::from_secs(900);
        let mut stats = DaemonStats::default();
        assert!(!stats.is_alive(now, period));

        stats.running = true;
        stats.heartbeat = Some(now - chrono::Duration::minutes(10));
        assert!(stats.is_alive(now, period));

        stats.heartbeat = Some(now - chrono::Duration::minutes(31));
        assert!(!stats.is_alive(now, period));

        stats.heartbeat = Some(now);
        stats.running = false;
        assert!(!stats.is_alive(now, period));
    }
}
