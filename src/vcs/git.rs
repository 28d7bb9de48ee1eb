//! `git` command-line backend
//!
//! Pull is fetch + rebase onto the remote branch. While a rebase is
//! stopped, stage 2 ("ours") is the upstream side and stage 3
//! ("theirs") is the local commit being replayed.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{BranchInfo, PullOutcome, PushOutcome, Resolution, Side, VersionControlBackend};
use crate::config::Config;
use crate::error::{FixbaseError, Result};

/// Shared-repository clone driven through the `git` binary
pub struct GitCli {
    work_tree: PathBuf,
    remote: String,
    branch: String,
    timeout: Duration,
    compaction_timeout: Duration,
}

impl GitCli {
    pub fn new(work_tree: PathBuf, remote: &str, branch: &str) -> Self {
        Self {
            work_tree,
            remote: remote.to_string(),
            branch: branch.to_string(),
            timeout: Duration::from_secs(30),
            compaction_timeout: Duration::from_secs(120),
        }
    }

    /// Open the configured clone; it must already exist
    pub fn from_config(config: &Config) -> Result<Self> {
        let work_tree = config.work_tree();
        if !work_tree.join(".git").exists() {
            return Err(FixbaseError::Config(format!(
                "{} is not a git clone of the shared repository",
                work_tree.display()
            )));
        }
        let mut git = Self::new(work_tree, &config.repository.remote, &config.repository.branch);
        git.timeout = config.repository.git_timeout();
        git.compaction_timeout = config.repository.compaction_timeout();
        Ok(git)
    }

    async fn run(&self, args: &[&str], limit: Duration) -> Result<Output> {
        debug!(?args, "git");
        let child = Command::new("git")
            .args(args)
            .current_dir(&self.work_tree)
            .env("GIT_EDITOR", "true")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FixbaseError::SyncTransient(format!("failed to run git: {}", e)))?;

        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!(?args, secs = limit.as_secs(), "git timed out");
                Err(FixbaseError::Timeout(limit.as_secs()))
            }
        }
    }

    /// Run and require success, returning stdout
    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args, self.timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(FixbaseError::SyncTransient(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn upstream(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    async fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn unmerged_paths(&self) -> Result<Vec<String>> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Turn a stopped rebase into `Conflicted`, or surface the failure
    async fn stopped(&self, output: &Output) -> Result<PullOutcome> {
        let paths = self.unmerged_paths().await?;
        if paths.is_empty() {
            return Err(FixbaseError::SyncTransient(format!(
                "rebase failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(count = paths.len(), "Rebase stopped on conflicts");
        Ok(PullOutcome::Conflicted(paths))
    }
}

#[async_trait]
impl VersionControlBackend for GitCli {
    fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    async fn pull(&self) -> Result<PullOutcome> {
        self.git(&["fetch", "--quiet", &self.remote, &self.branch]).await?;
        let before = self.head().await?;

        let upstream = self.upstream();
        let output = self.run(&["rebase", "--autostash", &upstream], self.timeout).await?;
        if !output.status.success() {
            return self.stopped(&output).await;
        }

        if self.head().await? == before {
            Ok(PullOutcome::UpToDate)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    async fn read_version(&self, path: &str, side: Side) -> Result<Option<Vec<u8>>> {
        let stage = match side {
            Side::Remote => 2,
            Side::Local => 3,
        };
        let spec = format!(":{}:{}", stage, path);
        let output = self.run(&["show", &spec], self.timeout).await?;
        Ok(output.status.success().then_some(output.stdout))
    }

    async fn resolve(&self, path: &str, resolution: Resolution) -> Result<()> {
        let content = match resolution {
            Resolution::Content(bytes) => Some(bytes),
            Resolution::Take(side) => self.read_version(path, side).await?,
        };

        match content {
            Some(bytes) => {
                let target = self.work_tree.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, bytes).await?;
                self.git(&["add", "--", path]).await?;
            }
            None => {
                self.git(&["rm", "--quiet", "--ignore-unmatch", "--", path]).await?;
            }
        }
        debug!(path, "Conflict resolved");
        Ok(())
    }

    async fn continue_merge(&self) -> Result<PullOutcome> {
        let output = self.run(&["rebase", "--continue"], self.timeout).await?;
        if output.status.success() {
            Ok(PullOutcome::Updated)
        } else {
            self.stopped(&output).await
        }
    }

    async fn abort_merge(&self) -> Result<()> {
        self.git(&["rebase", "--abort"]).await.map(|_| ())
    }

    async fn commit(&self, message: &str) -> Result<bool> {
        self.git(&["add", "--all"]).await?;
        let staged = self.run(&["diff", "--cached", "--quiet"], self.timeout).await?;
        if staged.status.success() {
            return Ok(false);
        }
        self.git(&["commit", "--quiet", "-m", message]).await?;
        info!(message, "Committed");
        Ok(true)
    }

    async fn push(&self) -> Result<PushOutcome> {
        let refspec = format!("HEAD:{}", self.branch);
        let output = self.run(&["push", "--porcelain", &self.remote, &refspec], self.timeout).await?;
        if output.status.success() {
            return Ok(PushOutcome::Pushed);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let rejected = ["rejected", "non-fast-forward", "fetch first"]
            .iter()
            .any(|marker| stderr.contains(marker) || stdout.contains(marker));
        if rejected {
            Ok(PushOutcome::Rejected(stderr.trim().to_string()))
        } else {
            Err(FixbaseError::SyncTransient(format!("push failed: {}", stderr.trim())))
        }
    }

    async fn branches(&self) -> Result<Vec<BranchInfo>> {
        let pattern = format!("refs/remotes/{}", self.remote);
        let out = self
            .git(&[
                "for-each-ref",
                "--format=%(refname:short)|%(committerdate:unix)",
                &pattern,
            ])
            .await?;

        Ok(out
            .lines()
            .filter_map(|line| {
                let (name, ts) = line.rsplit_once('|')?;
                let secs = ts.trim().parse::<i64>().ok()?;
                let last_commit = Utc.timestamp_opt(secs, 0).single()?;
                // Skip the symbolic origin/HEAD
                (!name.ends_with("/HEAD")).then(|| BranchInfo {
                    name: name.to_string(),
                    last_commit,
                })
            })
            .collect())
    }

    async fn compact(&self) -> Result<()> {
        let output = self
            .run(&["gc", "--auto", "--quiet"], self.compaction_timeout)
            .await?;
        if !output.status.success() {
            return Err(FixbaseError::SyncTransient(format!(
                "gc failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Repository compacted");
        Ok(())
    }
}
