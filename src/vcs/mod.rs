//! Version control seam
//!
//! The shared repository is reached only through `VersionControlBackend`.
//! `GitCli` drives a real clone; `MemoryBackend` simulates one in-process.
//!
//! `pull_resolving` implements the deterministic conflict policy:
//! - the public index takes the remote side, then replays local entries
//! - any other tracked artifact keeps the local side

pub mod git;
pub mod index;
pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{FixbaseError, Result};
use crate::fixes::Timestamp;

pub use git::GitCli;
pub use index::{merge_index, PublicIndex};
pub use memory::{MemoryBackend, MemoryRemote};

/// Rebase rounds before a pull is given up
const MAX_RESOLVE_ROUNDS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    Updated,
    /// Merge stopped; these paths need a resolution
    Conflicted(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Remote moved ahead of our base
    Rejected(String),
}

/// Which side of a conflict to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Our unpublished work
    Local,
    /// What the shared repository holds
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Take(Side),
    Content(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub last_commit: Timestamp,
}

/// Operations the core needs from the shared repository
#[async_trait]
pub trait VersionControlBackend: Send + Sync {
    /// Checkout the core reads artifacts from and writes them into
    fn work_tree(&self) -> &Path;

    /// Fetch and replay local commits on top of the remote branch
    async fn pull(&self) -> Result<PullOutcome>;

    /// One side of a conflicted path; `None` when absent on that side
    async fn read_version(&self, path: &str, side: Side) -> Result<Option<Vec<u8>>>;

    async fn resolve(&self, path: &str, resolution: Resolution) -> Result<()>;

    /// Continue after resolving; may stop again on the next commit
    async fn continue_merge(&self) -> Result<PullOutcome>;

    async fn abort_merge(&self) -> Result<()>;

    /// Stage everything and commit. `false` when there was nothing to commit
    async fn commit(&self, message: &str) -> Result<bool>;

    async fn push(&self) -> Result<PushOutcome>;

    async fn branches(&self) -> Result<Vec<BranchInfo>>;

    /// Repository garbage collection
    async fn compact(&self) -> Result<()>;
}

/// Result of a pull after automatic conflict resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub updated: bool,
    pub conflicts_resolved: usize,
}

/// Pull and resolve every conflict per the fixed policy.
///
/// On a failed resolution the merge is aborted and `MergeConflict` is
/// returned; the working tree is left as it was before the pull.
pub async fn pull_resolving(
    backend: &dyn VersionControlBackend,
    index_file: &str,
) -> Result<PullReport> {
    let mut outcome = backend.pull().await?;
    let mut report = PullReport::default();

    for _ in 0..MAX_RESOLVE_ROUNDS {
        let paths = match outcome {
            PullOutcome::UpToDate => return Ok(report),
            PullOutcome::Updated => {
                report.updated = true;
                return Ok(report);
            }
            PullOutcome::Conflicted(paths) => paths,
        };

        for path in &paths {
            if let Err(e) = resolve_path(backend, path, index_file).await {
                error!(path = %path, error = %e, "Conflict resolution failed, aborting pull");
                abort_quietly(backend).await;
                return Err(FixbaseError::MergeConflict {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        }
        report.conflicts_resolved += paths.len();
        info!(count = paths.len(), "Conflicts resolved");

        outcome = match backend.continue_merge().await {
            Ok(next) => next,
            Err(e) => {
                abort_quietly(backend).await;
                return Err(e);
            }
        };
    }

    abort_quietly(backend).await;
    Err(FixbaseError::MergeConflict {
        path: index_file.to_string(),
        reason: format!("still conflicted after {} rounds", MAX_RESOLVE_ROUNDS),
    })
}

/// Push, pulling once and pushing once more if the remote moved ahead.
///
/// Returns the report of the intermediate pull when one was needed. A
/// second rejection is surfaced as `PushRejected`, which is not retried
/// again within the cycle.
pub async fn push_with_retry(
    backend: &dyn VersionControlBackend,
    index_file: &str,
) -> Result<Option<PullReport>> {
    let reason = match backend.push().await? {
        PushOutcome::Pushed => return Ok(None),
        PushOutcome::Rejected(reason) => reason,
    };
    warn!(reason = %reason, "Push rejected, pulling before retry");

    let report = pull_resolving(backend, index_file).await?;
    match backend.push().await? {
        PushOutcome::Pushed => {
            info!(conflicts = report.conflicts_resolved, "Push succeeded after pull");
            Ok(Some(report))
        }
        PushOutcome::Rejected(reason) => Err(FixbaseError::PushRejected(reason)),
    }
}

async fn resolve_path(backend: &dyn VersionControlBackend, path: &str, index_file: &str) -> Result<()> {
    if path == index_file {
        let remote = backend.read_version(path, Side::Remote).await?;
        let local = backend.read_version(path, Side::Local).await?;
        let merged = merge_index(remote.as_deref(), local.as_deref());
        backend.resolve(path, Resolution::Content(merged.to_bytes()?)).await
    } else {
        backend.resolve(path, Resolution::Take(Side::Local)).await
    }
}

async fn abort_quietly(backend: &dyn VersionControlBackend) {
    if let Err(e) = backend.abort_merge().await {
        warn!(error = %e, "Failed to abort merge");
    }
}
