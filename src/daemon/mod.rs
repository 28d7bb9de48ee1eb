//! Sync daemon
//!
//! One tokio task driven by a `select!` over per-job interval timers:
//! - pull (15 min) and push (30 min) against the shared repository
//! - autofix, dictionary cleanup, reorganize, branch scan, dedup and
//!   compaction maintenance jobs
//!
//! Jobs run one at a time and are never preempted. Failures are logged
//! and counted; the next tick tries again.

pub mod maintenance;
pub mod schedule;
pub mod stats;
pub mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, timeout, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{FixbaseError, Result};
use crate::fixes::{FixDictionary, FixStore, QuarantineMark, RemoteRef, Timestamp};
use crate::guard::AbuseGuard;
use crate::identity::ConsensusIdIssuer;
use crate::state::StateStore;
use crate::vcs::{PublicIndex, VersionControlBackend};

pub use maintenance::{IdentityClass, QualityClass};
pub use schedule::Job;
pub use stats::{DaemonStats, JobRun};
pub use sync::{PullSummary, PushSummary};

/// Stops a running daemon from another task
#[derive(Clone)]
pub struct DaemonHandle {
    running: Arc<AtomicBool>,
    shutdown_tx: mpsc::Sender<()>,
}

impl DaemonHandle {
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct SyncDaemon {
    config: Config,
    state: Arc<StateStore>,
    store: Arc<FixStore>,
    guard: Arc<AbuseGuard>,
    issuer: Arc<ConsensusIdIssuer>,
    backend: Arc<dyn VersionControlBackend>,
    running: Arc<AtomicBool>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl SyncDaemon {
    pub fn new(config: Config, state: Arc<StateStore>, backend: Arc<dyn VersionControlBackend>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        Self {
            store: Arc::new(FixStore::new(state.clone(), config.node.identity.clone())),
            guard: Arc::new(AbuseGuard::new(state.clone(), &config.guard)),
            issuer: Arc::new(ConsensusIdIssuer::new(state.clone(), &config.issuer)),
            config,
            state,
            backend,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        }
    }

    pub fn store(&self) -> &Arc<FixStore> {
        &self.store
    }

    pub fn guard(&self) -> &Arc<AbuseGuard> {
        &self.guard
    }

    pub fn issuer(&self) -> &Arc<ConsensusIdIssuer> {
        &self.issuer
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            running: self.running.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    pub fn stats(&self) -> Result<DaemonStats> {
        self.state.load()
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Run until stopped through a `DaemonHandle`
    pub async fn start(&mut self) -> Result<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| FixbaseError::Config("daemon already started".to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        let now = Utc::now();
        self.update_stats(|stats| {
            stats.running = true;
            stats.started_at = Some(now);
            stats.heartbeat = Some(now);
        })?;

        info!(
            identity = %self.config.node.identity,
            work_tree = %self.backend.work_tree().display(),
            pull_secs = self.config.sync.pull_interval_secs,
            push_secs = self.config.sync.push_interval_secs,
            "Sync daemon started"
        );

        // Pull fires immediately; everything else waits one period
        let mut pull = interval(Job::Pull.period(&self.config));
        pull.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut push = self.timer(Job::Push);
        let mut autofix = self.timer(Job::Autofix);
        let mut cleanup = self.timer(Job::DictionaryCleanup);
        let mut reorganize = self.timer(Job::Reorganize);
        let mut branch_scan = self.timer(Job::BranchScan);
        let mut dedup = self.timer(Job::Dedup);
        let mut compaction = self.timer(Job::Compaction);

        loop {
            let job = tokio::select! {
                _ = pull.tick() => Job::Pull,
                _ = push.tick() => Job::Push,
                _ = autofix.tick() => Job::Autofix,
                _ = cleanup.tick() => Job::DictionaryCleanup,
                _ = reorganize.tick() => Job::Reorganize,
                _ = branch_scan.tick() => Job::BranchScan,
                _ = dedup.tick() => Job::Dedup,
                _ = compaction.tick() => Job::Compaction,
                _ = shutdown_rx.recv() => {
                    info!("Sync daemon shutting down");
                    break;
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            // Failures are logged and counted inside run_job
            let _ = self.run_job(job).await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.update_stats(|stats| stats.running = false)?;
        Ok(())
    }

    fn timer(&self, job: Job) -> Interval {
        let period = job.period(&self.config);
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    /// One pull followed by one push
    pub async fn sync_once(&self) -> Result<()> {
        self.run_job(Job::Pull).await?;
        self.run_job(Job::Push).await
    }

    /// Run one job, recording the outcome in the daemon stats
    pub async fn run_job(&self, job: Job) -> Result<()> {
        let started = Instant::now();
        let result = match job {
            Job::Pull | Job::Push => self.execute(job).await,
            _ => {
                let limit = Duration::from_secs(self.config.maintenance.job_timeout_secs);
                match timeout(limit, self.execute(job)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(job = %job, secs = limit.as_secs(), "Job timed out");
                        Err(FixbaseError::Timeout(limit.as_secs()))
                    }
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(job = %job, duration_ms, "Job finished"),
            Err(e) => error!(job = %job, error = %e, duration_ms, "Job failed"),
        }

        let now = Utc::now();
        let ok = result.is_ok();
        let failure = result.as_ref().err().map(|e| e.to_string());
        let recorded = self.update_stats(|stats| {
            stats.heartbeat = Some(now);
            stats.record_run(job.as_str(), JobRun { at: now, ok, duration_ms });
            if let Some(message) = failure {
                stats.failed_cycles += 1;
                stats.last_error = Some(format!("{}: {}", job, message));
            }
        });
        if let Err(e) = recorded {
            warn!(error = %e, "Failed to record job stats");
        }
        result
    }

    async fn execute(&self, job: Job) -> Result<()> {
        match job {
            Job::Pull => self.pull().await.map(|_| ()),
            Job::Push => self.push().await.map(|_| ()),
            Job::Autofix => self.autofix(),
            Job::DictionaryCleanup => self.cleanup().await,
            Job::Reorganize => self.reorganize(),
            Job::BranchScan => self.branch_scan().await,
            Job::Dedup => self.dedup().await,
            Job::Compaction => self.compaction().await,
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Pull, resolve conflicts, refresh the remote cache
    pub async fn pull(&self) -> Result<PullSummary> {
        let backend = self.backend.as_ref();
        let store = self.store.as_ref();
        let index_file = self.config.repository.index_file.as_str();
        let summary = sync::retry_once("pull", self.backoff(), move || {
            sync::pull(backend, store, index_file)
        })
        .await?;

        let conflicts = summary.report.conflicts_resolved as u64;
        self.update_stats(|stats| {
            stats.pulls += 1;
            stats.conflicts_resolved += conflicts;
        })?;
        Ok(summary)
    }

    /// Commit local changes and push, pulling once on rejection
    pub async fn push(&self) -> Result<PushSummary> {
        let backend = self.backend.as_ref();
        let index_file = self.config.repository.index_file.as_str();
        let summary = sync::retry_once("push", self.backoff(), move || {
            sync::push(backend, index_file)
        })
        .await?;

        if summary.pulled.is_some() {
            // The remote moved; pick up what it brought
            sync::refresh_cache(&self.store, backend.work_tree(), index_file)?;
        }
        let conflicts = summary.pulled.map_or(0, |r| r.conflicts_resolved as u64);
        self.update_stats(|stats| {
            stats.pushes += 1;
            stats.conflicts_resolved += conflicts;
        })?;
        Ok(summary)
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.sync.retry_backoff_ms)
    }

    // =========================================================================
    // Maintenance jobs
    // =========================================================================

    fn autofix(&self) -> Result<()> {
        let rescored = self.store.rescore_all()?;
        let assigned = self.issuer.process_queue()?;
        info!(rescored, assigned = assigned.len(), "Autofix pass complete");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let expired = self.store.cleanup_expired()?;
        let housekeeping = self.guard.housekeeping()?;
        let removed = self
            .edit_index("Clean up public index", maintenance::cleanup_refs)
            .await?;

        info!(
            expired,
            removed,
            pruned = housekeeping.pruned_timestamps,
            lifted = housekeeping.lifted_bans,
            "Dictionary cleanup complete"
        );
        self.update_stats(|stats| stats.refs_cleaned += removed as u64)
    }

    fn reorganize(&self) -> Result<()> {
        let index = PublicIndex::load(&self.index_path())?;
        let ledger = self.guard.ledger()?;
        let classes = maintenance::reorganize(&index.refs, &ledger);

        for (owner, class) in classes.iter().filter(|(_, c)| c.flagged_for_review) {
            warn!(
                owner_id = %owner,
                success_rate = class.success_rate,
                spam_rate = class.spam_rate,
                "Identity flagged for review"
            );
        }
        self.update_stats(|stats| stats.identity_classes = classes)
    }

    async fn branch_scan(&self) -> Result<()> {
        let branches = self.backend.branches().await?;
        let stale = maintenance::stale_branches(
            &branches,
            self.config.maintenance.stale_branch_days,
            Utc::now(),
        );
        for name in &stale {
            info!(branch = %name, "Stale branch");
        }
        self.update_stats(|stats| stats.stale_branches = stale)
    }

    async fn dedup(&self) -> Result<()> {
        let now = Utc::now();
        let fixes = self
            .state
            .update(|dict: &mut FixDictionary| Ok(maintenance::dedup_merge_fixes(dict, now)))?;
        let refs = self
            .edit_index("Merge duplicate fixes", maintenance::dedup_merge_refs)
            .await?;

        self.update_stats(|stats| {
            stats.fixes_merged += fixes as u64;
            stats.refs_merged += refs as u64;
        })
    }

    async fn compaction(&self) -> Result<()> {
        let limit = self.config.repository.compaction_timeout();
        match timeout(limit, self.backend.compact()).await {
            Ok(result) => result?,
            Err(_) => return Err(FixbaseError::Timeout(limit.as_secs())),
        }
        self.state.vacuum()
    }

    // =========================================================================
    // Quarantine
    // =========================================================================

    /// Set or clear the quarantine flag on a fix everywhere this node can
    /// reach: the local dictionary, the remote cache and the public index
    /// in the work tree. An index change is committed and goes out with
    /// the next push.
    ///
    /// Returns how many records were touched.
    pub async fn quarantine(
        &self,
        fix_hash: &str,
        quarantined: bool,
        actor: &str,
        reason: &str,
    ) -> Result<usize> {
        let local = match self.store.set_quarantine(fix_hash, quarantined, actor, reason) {
            Ok(touched) => touched,
            Err(FixbaseError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };

        let message = if quarantined {
            format!("Quarantine fix {}", fix_hash)
        } else {
            format!("Release fix {}", fix_hash)
        };
        let published = self
            .edit_index(&message, |refs, now| {
                let mark = quarantined.then(|| QuarantineMark {
                    by: actor.to_string(),
                    reason: reason.to_string(),
                    at: now,
                });
                let mut touched = 0;
                for r in refs
                    .iter_mut()
                    .filter(|r| r.fix_hash == fix_hash && r.quarantined != quarantined)
                {
                    r.quarantined = quarantined;
                    r.quarantine = mark.clone();
                    touched += 1;
                }
                touched
            })
            .await?;

        if local + published == 0 {
            return Err(FixbaseError::NotFound(format!("fix {}", fix_hash)));
        }
        info!(fix_hash, quarantined, local, published, "Quarantine applied");
        Ok(local + published)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn index_path(&self) -> std::path::PathBuf {
        self.backend.work_tree().join(&self.config.repository.index_file)
    }

    /// Apply a maintenance edit to the public index. A changed index is
    /// saved, committed and reloaded into the cache in the same call.
    async fn edit_index(
        &self,
        message: &str,
        edit: impl FnOnce(&mut Vec<RemoteRef>, Timestamp) -> usize,
    ) -> Result<usize> {
        let path = self.index_path();
        let mut index = PublicIndex::load(&path)?;
        let changed = edit(&mut index.refs, Utc::now());
        if changed == 0 {
            return Ok(0);
        }

        index.save(&path)?;
        self.backend.commit(message).await?;
        sync::refresh_cache(
            &self.store,
            self.backend.work_tree(),
            &self.config.repository.index_file,
        )?;
        Ok(changed)
    }

    fn update_stats(&self, f: impl FnOnce(&mut DaemonStats)) -> Result<()> {
        self.state.update(|stats: &mut DaemonStats| {
            f(stats);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::NewFix;
    use crate::vcs::{MemoryBackend, MemoryRemote};
    use tempfile::TempDir;

    fn daemon(dir: &TempDir, remote: &Arc<MemoryRemote>, identity: &str) -> SyncDaemon {
        let mut config = Config::default();
        config.node.identity = identity.to_string();
        config.sync.retry_backoff_ms = 1;
        let backend =
            MemoryBackend::clone_from(remote.clone(), &dir.path().join(identity)).unwrap();
        SyncDaemon::new(
            config,
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(backend),
        )
    }

    #[tokio::test]
    async fn test_dedup_job_merges_local_duplicates() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let d = daemon(&dir, &remote, "cid-a");
        d.store()
            .add_fix(NewFix::new("NameError", "NameError: name 'os' is not defined", "import os"))
            .unwrap();
        d.store()
            .add_fix(NewFix::new("NameError", "NameError: name 'sys' is not defined", "import sys"))
            .unwrap();

        d.run_job(Job::Dedup).await.unwrap();
        assert_eq!(d.store().all_fixes().unwrap().len(), 1);

        d.run_job(Job::Dedup).await.unwrap();
        let stats = d.stats().unwrap();
        assert_eq!(stats.fixes_merged, 1);
        assert!(stats.last_runs["dedup"].ok);
    }

    #[tokio::test]
    async fn test_branch_scan_and_compaction() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote
            .set_branch("origin/old", Utc::now() - chrono::Duration::days(60))
            .unwrap();
        let d = daemon(&dir, &remote, "cid-a");

        d.run_job(Job::BranchScan).await.unwrap();
        d.run_job(Job::Compaction).await.unwrap();

        assert_eq!(d.stats().unwrap().stale_branches, vec!["origin/old".to_string()]);
        assert_eq!(remote.compactions().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_counted() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let d = daemon(&dir, &remote, "cid-a");

        // Uncommitted change blocks the pull on both attempts
        std::fs::write(dir.path().join("cid-a").join("scratch.txt"), "x").unwrap();
        assert!(d.run_job(Job::Pull).await.is_err());

        let stats = d.stats().unwrap();
        assert_eq!(stats.failed_cycles, 1);
        assert!(stats.last_error.unwrap().starts_with("pull"));
        assert!(!stats.last_runs["pull"].ok);
    }

    #[tokio::test]
    async fn test_quarantined_index_entry_expires_through_cleanup() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let d = daemon(&dir, &remote, "cid-a");

        let published_at = Utc::now() - chrono::Duration::days(40);
        let entry = |hash: &str| RemoteRef {
            fix_hash: hash.to_string(),
            owner_id: "cid-b".to_string(),
            error_type: "NameError".to_string(),
            error_signature: format!("nameerror: name '{}' is not defined", hash),
            timestamp: published_at,
            artifact: format!("fixes/cid-b/{}.enc", hash),
            signature: format!("fixes/cid-b/{}.sig", hash),
            quality_score: None,
            usage_count: None,
            success_rate: None,
            quarantined: false,
            quarantine: None,
            merged_from: Vec::new(),
        };
        let mut index = PublicIndex::default();
        index.append(entry("bad"));
        index.append(entry("good"));
        index.save(&d.index_path()).unwrap();

        assert_eq!(d.quarantine("bad", true, "reviewer", "exfiltrates").await.unwrap(), 1);
        let index = PublicIndex::load(&d.index_path()).unwrap();
        let bad = index.refs.iter().find(|r| r.fix_hash == "bad").unwrap();
        assert!(bad.quarantined);
        assert_eq!(bad.quarantine.as_ref().unwrap().by, "reviewer");

        assert!(matches!(
            d.quarantine("missing", true, "reviewer", "typo").await,
            Err(FixbaseError::NotFound(_))
        ));

        d.run_job(Job::DictionaryCleanup).await.unwrap();
        let index = PublicIndex::load(&d.index_path()).unwrap();
        assert_eq!(index.refs.len(), 1);
        assert_eq!(index.refs[0].fix_hash, "good");
        assert_eq!(d.stats().unwrap().refs_cleaned, 1);
    }

    #[tokio::test]
    async fn test_loop_runs_initial_pull_and_stops() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let mut d = daemon(&dir, &remote, "cid-a");
        let handle = d.handle();

        let task = tokio::spawn(async move {
            let result = d.start().await;
            (d, result)
        });

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if handle.is_running() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let (d, result) = task.await.unwrap();
        result.unwrap();
        let stats = d.stats().unwrap();
        assert!(stats.pulls >= 1);
        assert!(!stats.running);
    }
}
