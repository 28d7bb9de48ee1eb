//! fixbase CLI - daemon control and manual operations

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use clap::Subcommand;
use tracing::info;

use crate::config::Config;
use crate::daemon::{DaemonStats, Job, SyncDaemon};
use crate::error::Result;
use crate::fixes::{FixDictionary, FixStore, RemoteCache};
use crate::identity::ConsensusIdIssuer;
use crate::publish::{ArtifactCrypto, PublishOutcome, Publisher};
use crate::state::StateStore;
use crate::vcs::GitCli;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the sync daemon in the foreground until Ctrl-C
    Start,

    /// Show daemon status and statistics
    Status,

    /// Print the effective configuration
    Config,

    /// Run one pull + push cycle
    Sync,

    /// Run one scheduled job once
    RunJob {
        /// pull, push, autofix, dictionary_cleanup, reorganize, branch_scan, dedup, compaction
        job: Job,
    },

    /// Publish a local fix to the shared repository if it clears the bar
    Publish {
        /// Fix hash
        hash: String,

        /// Script or command the fix was recorded against
        #[arg(long)]
        script_ref: Option<String>,
    },

    /// Quarantine a fix (locally and in the public index), or release it with --clear
    Quarantine {
        /// Fix hash
        hash: String,

        /// Audit note stored with the flag
        #[arg(short, long, default_value = "manual review")]
        reason: String,

        /// Who is setting the flag
        #[arg(long, default_value = "operator")]
        actor: String,

        /// Clear the flag instead of setting it
        #[arg(long)]
        clear: bool,
    },
}

/// Run a command, returning the text to print
pub async fn execute_command(command: Commands, config: Config) -> Result<String> {
    match command {
        Commands::Config => config.to_toml(),
        Commands::Status => status(&config),
        Commands::Start => {
            let mut daemon = open_daemon(config)?;
            let handle = daemon.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received");
                    handle.stop().await;
                }
            });
            daemon.start().await?;
            Ok("Sync daemon stopped".to_string())
        }
        Commands::Sync => {
            let daemon = open_daemon(config)?;
            daemon.sync_once().await?;
            let stats = daemon.stats()?;
            Ok(format!(
                "Sync complete (pulls: {}, pushes: {}, conflicts resolved: {})",
                stats.pulls, stats.pushes, stats.conflicts_resolved
            ))
        }
        Commands::RunJob { job } => {
            let daemon = open_daemon(config)?;
            daemon.run_job(job).await?;
            Ok(format!("Job {} finished", job))
        }
        Commands::Publish { hash, script_ref } => {
            let state = Arc::new(StateStore::open(&config.node.data_dir)?);
            let backend = Arc::new(GitCli::from_config(&config)?);
            let crypto = ArtifactCrypto::load_or_create(&config.keys_dir(), &config.node.identity)?;
            let daemon = SyncDaemon::new(config.clone(), state, backend.clone());
            let publisher = Publisher::new(
                daemon.store().clone(),
                daemon.guard().clone(),
                Arc::new(crypto),
                backend,
                &config,
            );
            match publisher.publish(&hash, script_ref.as_deref()).await? {
                PublishOutcome::Published { artifact, .. } => Ok(format!("Published {}", artifact)),
                PublishOutcome::LocalOnly { reason } => Ok(format!("Kept local: {}", reason)),
            }
        }
        Commands::Quarantine {
            hash,
            reason,
            actor,
            clear,
        } => {
            // Without a clone only local copies can be marked
            let touched = if config.work_tree().join(".git").exists() {
                let daemon = open_daemon(config)?;
                daemon.quarantine(&hash, !clear, &actor, &reason).await?
            } else {
                let state = Arc::new(StateStore::open(&config.node.data_dir)?);
                let store = FixStore::new(state, config.node.identity.clone());
                store.set_quarantine(&hash, !clear, &actor, &reason)?
            };
            let verb = if clear { "released" } else { "quarantined" };
            Ok(format!("Fix {} {} ({} records)", hash, verb, touched))
        }
    }
}

fn open_daemon(config: Config) -> Result<SyncDaemon> {
    let state = Arc::new(StateStore::open(&config.node.data_dir)?);
    let backend = Arc::new(GitCli::from_config(&config)?);
    Ok(SyncDaemon::new(config, state, backend))
}

fn status(config: &Config) -> Result<String> {
    let state = Arc::new(StateStore::open(&config.node.data_dir)?);
    let stats: DaemonStats = state.load()?;
    let dict: FixDictionary = state.load()?;
    let cache: RemoteCache = state.load()?;
    let (available, queued) = ConsensusIdIssuer::new(state.clone(), &config.issuer).pool_stats()?;

    let alive = stats.is_alive(Utc::now(), Job::shortest_period(config));
    let fmt_time = |t: Option<chrono::DateTime<Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    };

    let mut out = String::new();
    let _ = writeln!(out, "Daemon:             {}", if alive { "running" } else { "stopped" });
    let _ = writeln!(out, "Identity:           {}", config.node.identity);
    let _ = writeln!(out, "Started:            {}", fmt_time(stats.started_at));
    let _ = writeln!(out, "Heartbeat:          {}", fmt_time(stats.heartbeat));
    let _ = writeln!(out, "Pulls / pushes:     {} / {}", stats.pulls, stats.pushes);
    let _ = writeln!(out, "Conflicts resolved: {}", stats.conflicts_resolved);
    let _ = writeln!(out, "Failed cycles:      {}", stats.failed_cycles);
    let _ = writeln!(out, "Fixes merged:       {}", stats.fixes_merged);
    let _ = writeln!(out, "Refs merged/clean:  {} / {}", stats.refs_merged, stats.refs_cleaned);
    let _ = writeln!(out, "Local fixes:        {} ({} archived)", dict.len(), dict.archived.len());
    let _ = writeln!(out, "Cached refs:        {} (last sync {})", cache.refs.len(), fmt_time(cache.last_sync));
    let _ = writeln!(out, "ID pool:            {} available, {} queued", available, queued);

    if !stats.stale_branches.is_empty() {
        let _ = writeln!(out, "Stale branches:     {}", stats.stale_branches.join(", "));
    }
    let flagged: Vec<_> = stats
        .identity_classes
        .iter()
        .filter(|(_, c)| c.flagged_for_review)
        .map(|(owner, _)| owner.as_str())
        .collect();
    if !flagged.is_empty() {
        let _ = writeln!(out, "Flagged identities: {}", flagged.join(", "));
    }
    for (job, run) in &stats.last_runs {
        let _ = writeln!(
            out,
            "  {:<20} {} {} ({} ms)",
            job,
            run.at.to_rfc3339(),
            if run.ok { "ok" } else { "FAILED" },
            run.duration_ms
        );
    }
    if let Some(error) = &stats.last_error {
        let _ = writeln!(out, "Last error:         {}", error);
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.node.identity = "cid-test".to_string();
        config
    }

    #[tokio::test]
    async fn test_status_on_fresh_data_dir() {
        let dir = TempDir::new().unwrap();
        let output = execute_command(Commands::Status, config(&dir)).await.unwrap();
        assert!(output.contains("Daemon:             stopped"));
        assert!(output.contains("cid-test"));
        assert!(output.contains("10 available, 0 queued"));
    }

    #[tokio::test]
    async fn test_config_prints_toml() {
        let dir = TempDir::new().unwrap();
        let output = execute_command(Commands::Config, config(&dir)).await.unwrap();
        assert!(output.contains("[sync]"));
        assert!(output.contains("pull_interval_secs = 900"));
    }

    #[tokio::test]
    async fn test_sync_without_clone_fails() {
        let dir = TempDir::new().unwrap();
        assert!(execute_command(Commands::Sync, config(&dir)).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_without_clone_fails() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Publish {
            hash: "nope".to_string(),
            script_ref: None,
        };
        assert!(execute_command(command, config(&dir)).await.is_err());
    }

    #[tokio::test]
    async fn test_quarantine_unknown_fix() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Quarantine {
            hash: "nope".to_string(),
            reason: "test".to_string(),
            actor: "tester".to_string(),
            clear: false,
        };
        assert!(execute_command(command, config(&dir)).await.is_err());
    }
}
