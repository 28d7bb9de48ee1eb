//! fixbase configuration
//!
//! Every section and field has a default, so an empty or partial
//! `fixbase.toml` is valid. CLI flags override file values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FixbaseError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub issuer: IssuerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory (state database, keys, default work tree)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Local anonymized owner id
    #[serde(default = "default_identity")]
    pub identity: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            identity: default_identity(),
        }
    }
}

/// Shared fix repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Local clone; `<data_dir>/repo` when unset
    #[serde(default)]
    pub work_tree: Option<PathBuf>,

    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Public index path inside the work tree
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Directory for encrypted artifacts and signatures
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,

    #[serde(default = "default_compaction_timeout")]
    pub compaction_timeout_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            work_tree: None,
            remote: default_remote(),
            branch: default_branch(),
            index_file: default_index_file(),
            artifact_dir: default_artifact_dir(),
            git_timeout_secs: default_git_timeout(),
            compaction_timeout_secs: default_compaction_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_pull_interval")]
    pub pull_interval_secs: u64,

    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// Pause before the single retry of a transient failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_interval_secs: default_pull_interval(),
            push_interval_secs: default_push_interval(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Idle-time job timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_autofix_interval")]
    pub autofix_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub dictionary_cleanup_interval_secs: u64,

    #[serde(default = "default_reorganize_interval")]
    pub reorganize_interval_secs: u64,

    #[serde(default = "default_branch_scan_interval")]
    pub branch_scan_interval_secs: u64,

    #[serde(default = "default_dedup_interval")]
    pub dedup_interval_secs: u64,

    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_secs: u64,

    /// Branches idle longer than this are reported
    #[serde(default = "default_stale_branch_days")]
    pub stale_branch_days: i64,

    /// Upper bound for one job run
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            autofix_interval_secs: default_autofix_interval(),
            dictionary_cleanup_interval_secs: default_cleanup_interval(),
            reorganize_interval_secs: default_reorganize_interval(),
            branch_scan_interval_secs: default_branch_scan_interval(),
            dedup_interval_secs: default_dedup_interval(),
            compaction_interval_secs: default_compaction_interval(),
            stale_branch_days: default_stale_branch_days(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_uploads_per_hour")]
    pub max_uploads_per_hour: usize,

    #[serde(default = "default_uploads_per_day")]
    pub max_uploads_per_day: usize,

    /// Uploads with a success rate below this count as low quality
    #[serde(default = "default_low_quality_threshold")]
    pub low_quality_threshold: f64,

    /// Low-quality uploads that earn a spam strike
    #[serde(default = "default_low_quality_strike_after")]
    pub low_quality_strike_after: u32,

    /// Path to content rules file (optional)
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_uploads_per_hour: default_uploads_per_hour(),
            max_uploads_per_day: default_uploads_per_day(),
            low_quality_threshold: default_low_quality_threshold(),
            low_quality_strike_after: default_low_quality_strike_after(),
            rules_file: None,
        }
    }
}

/// Local -> global promotion bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,

    #[serde(default = "default_min_usage")]
    pub min_usage: u64,

    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            min_usage: default_min_usage(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Available IDs kept in the pool
    #[serde(default = "default_pool_floor")]
    pub pool_floor: usize,

    /// Minimum gap between replenishment syncs
    #[serde(default = "default_replenish_interval")]
    pub replenish_interval_secs: u64,

    /// Estimated wait per queue position
    #[serde(default = "default_wait_per_position")]
    pub wait_per_position_secs: u64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            pool_floor: default_pool_floor(),
            replenish_interval_secs: default_replenish_interval(),
            wait_per_position_secs: default_wait_per_position(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("./.fixbase") }
fn default_identity() -> String { "local".to_string() }
fn default_remote() -> String { "origin".to_string() }
fn default_branch() -> String { "main".to_string() }
fn default_index_file() -> String { "index.json".to_string() }
fn default_artifact_dir() -> String { "fixes".to_string() }
fn default_git_timeout() -> u64 { 30 }
fn default_compaction_timeout() -> u64 { 120 }
fn default_pull_interval() -> u64 { 15 * 60 }
fn default_push_interval() -> u64 { 30 * 60 }
fn default_retry_backoff() -> u64 { 2000 }
fn default_autofix_interval() -> u64 { 3600 }
fn default_cleanup_interval() -> u64 { 2 * 3600 }
fn default_reorganize_interval() -> u64 { 4 * 3600 }
fn default_branch_scan_interval() -> u64 { 6 * 3600 }
fn default_dedup_interval() -> u64 { 8 * 3600 }
fn default_compaction_interval() -> u64 { 12 * 3600 }
fn default_stale_branch_days() -> i64 { 30 }
fn default_job_timeout() -> u64 { 120 }
fn default_uploads_per_hour() -> usize { 20 }
fn default_uploads_per_day() -> usize { 100 }
fn default_low_quality_threshold() -> f64 { 0.2 }
fn default_low_quality_strike_after() -> u32 { 10 }
fn default_min_quality() -> f64 { 8.0 }
fn default_min_usage() -> u64 { 25 }
fn default_min_success_rate() -> f64 { 0.85 }
fn default_pool_floor() -> usize { 10 }
fn default_replenish_interval() -> u64 { 3600 }
fn default_wait_per_position() -> u64 { 360 }

impl Config {
    /// Load from a TOML file, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| FixbaseError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FixbaseError::Config(e.to_string()))
    }

    pub fn work_tree(&self) -> PathBuf {
        self.repository
            .work_tree
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("repo"))
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.node.data_dir.join("keys")
    }
}

impl RepositoryConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn compaction_timeout(&self) -> Duration {
        Duration::from_secs(self.compaction_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.pull_interval_secs, 900);
        assert_eq!(config.sync.push_interval_secs, 1800);
        assert_eq!(config.maintenance.compaction_interval_secs, 43200);
        assert_eq!(config.guard.max_uploads_per_hour, 20);
        assert_eq!(config.issuer.pool_floor, 10);
        assert_eq!(config.work_tree(), PathBuf::from("./.fixbase/repo"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fixbase.toml");
        std::fs::write(
            &path,
            "[node]\nidentity = \"cid-42\"\n\n[sync]\npull_interval_secs = 60\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.identity, "cid-42");
        assert_eq!(config.node.data_dir, PathBuf::from("./.fixbase"));
        assert_eq!(config.sync.pull_interval_secs, 60);
        assert_eq!(config.sync.push_interval_secs, 1800);
        assert_eq!(config.publish.min_usage, 25);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.repository.branch, "main");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fixbase.toml");
        std::fs::write(&path, "[sync]\npull_interval_secs = \"soon\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(FixbaseError::Config(_))));
    }

    #[test]
    fn test_renders_as_toml() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[maintenance]"));
        let back: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(back.guard.max_uploads_per_day, 100);
    }
}
