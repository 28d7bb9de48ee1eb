//! In-process repository simulation
//!
//! `MemoryRemote` plays the shared repository; each `MemoryBackend` is one
//! clone of it with a real working tree on disk. Pull does a three-way
//! merge against the last synced remote snapshot and stops on paths both
//! sides changed, like a rebase would. Used by tests and offline runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{BranchInfo, PullOutcome, PushOutcome, Resolution, Side, VersionControlBackend};
use crate::error::{FixbaseError, Result};
use crate::fixes::Timestamp;

/// Relative path -> content
pub type Snapshot = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct RemoteState {
    version: u64,
    files: Snapshot,
    branches: BTreeMap<String, Timestamp>,
    compactions: u64,
}

/// Simulated shared repository
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, RemoteState>> {
        self.inner.lock().map_err(|_| FixbaseError::LockPoisoned)
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.lock()?.version)
    }

    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.files.get(path).cloned())
    }

    pub fn files(&self) -> Result<Snapshot> {
        Ok(self.lock()?.files.clone())
    }

    /// Register a branch with the given last-commit time
    pub fn set_branch(&self, name: &str, last_commit: Timestamp) -> Result<()> {
        self.lock()?.branches.insert(name.to_string(), last_commit);
        Ok(())
    }

    pub fn compactions(&self) -> Result<u64> {
        Ok(self.lock()?.compactions)
    }
}

struct MergeState {
    remote_version: u64,
    remote: Snapshot,
    local: Snapshot,
    merged: Snapshot,
    unresolved: BTreeSet<String>,
}

struct LocalState {
    base_version: u64,
    /// Remote snapshot at the last sync
    base: Snapshot,
    /// Last local commit
    head: Snapshot,
    merge: Option<MergeState>,
}

/// One clone of a `MemoryRemote`
pub struct MemoryBackend {
    work_tree: PathBuf,
    remote: Arc<MemoryRemote>,
    local: Mutex<LocalState>,
}

impl MemoryBackend {
    /// Clone the remote into `work_tree`
    pub fn clone_from(remote: Arc<MemoryRemote>, work_tree: &Path) -> Result<Self> {
        let (version, files) = {
            let state = remote.lock()?;
            (state.version, state.files.clone())
        };
        std::fs::create_dir_all(work_tree)?;
        write_tree(work_tree, &files)?;
        Ok(Self {
            work_tree: work_tree.to_path_buf(),
            remote,
            local: Mutex::new(LocalState {
                base_version: version,
                base: files.clone(),
                head: files,
                merge: None,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.local.lock().map_err(|_| FixbaseError::LockPoisoned)
    }

    fn conflicted(unresolved: &BTreeSet<String>) -> PullOutcome {
        PullOutcome::Conflicted(unresolved.iter().cloned().collect())
    }
}

#[async_trait]
impl VersionControlBackend for MemoryBackend {
    fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let mut local = self.lock()?;
        if local.merge.is_some() {
            return Err(FixbaseError::SyncTransient("merge already in progress".to_string()));
        }
        if snapshot(&self.work_tree)? != local.head {
            return Err(FixbaseError::SyncTransient(
                "working tree has uncommitted changes".to_string(),
            ));
        }

        let (remote_version, remote) = {
            let state = self.remote.lock()?;
            (state.version, state.files.clone())
        };
        if remote_version == local.base_version {
            return Ok(PullOutcome::UpToDate);
        }

        let paths: BTreeSet<&String> = local
            .base
            .keys()
            .chain(local.head.keys())
            .chain(remote.keys())
            .collect();

        let mut merged = Snapshot::new();
        let mut unresolved = BTreeSet::new();
        for path in paths {
            let b = local.base.get(path);
            let l = local.head.get(path);
            let r = remote.get(path);
            let pick = if l == r || r == b {
                l
            } else if l == b {
                r
            } else {
                unresolved.insert(path.clone());
                // Conflicted paths keep the remote copy until resolved
                r
            };
            if let Some(content) = pick {
                merged.insert(path.clone(), content.clone());
            }
        }

        write_tree(&self.work_tree, &merged)?;

        if unresolved.is_empty() {
            local.head = merged;
            local.base = remote;
            local.base_version = remote_version;
            debug!(version = remote_version, "Pulled");
            return Ok(PullOutcome::Updated);
        }

        let outcome = Self::conflicted(&unresolved);
        let head = local.head.clone();
        local.merge = Some(MergeState {
            remote_version,
            remote,
            local: head,
            merged,
            unresolved,
        });
        Ok(outcome)
    }

    async fn read_version(&self, path: &str, side: Side) -> Result<Option<Vec<u8>>> {
        let local = self.lock()?;
        let merge = local
            .merge
            .as_ref()
            .ok_or_else(|| FixbaseError::SyncTransient("no merge in progress".to_string()))?;
        Ok(match side {
            Side::Local => merge.local.get(path).cloned(),
            Side::Remote => merge.remote.get(path).cloned(),
        })
    }

    async fn resolve(&self, path: &str, resolution: Resolution) -> Result<()> {
        let mut local = self.lock()?;
        let merge = local
            .merge
            .as_mut()
            .ok_or_else(|| FixbaseError::SyncTransient("no merge in progress".to_string()))?;

        let content = match resolution {
            Resolution::Content(bytes) => Some(bytes),
            Resolution::Take(Side::Local) => merge.local.get(path).cloned(),
            Resolution::Take(Side::Remote) => merge.remote.get(path).cloned(),
        };

        let target = self.work_tree.join(path);
        match content {
            Some(bytes) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, &bytes)?;
                merge.merged.insert(path.to_string(), bytes);
            }
            None => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                merge.merged.remove(path);
            }
        }
        merge.unresolved.remove(path);
        Ok(())
    }

    async fn continue_merge(&self) -> Result<PullOutcome> {
        let mut local = self.lock()?;
        let Some(merge) = local.merge.take() else {
            return Err(FixbaseError::SyncTransient("no merge in progress".to_string()));
        };
        if !merge.unresolved.is_empty() {
            let outcome = Self::conflicted(&merge.unresolved);
            local.merge = Some(merge);
            return Ok(outcome);
        }
        local.head = merge.merged;
        local.base = merge.remote;
        local.base_version = merge.remote_version;
        Ok(PullOutcome::Updated)
    }

    async fn abort_merge(&self) -> Result<()> {
        let mut local = self.lock()?;
        if local.merge.take().is_some() {
            write_tree(&self.work_tree, &local.head)?;
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<bool> {
        let mut local = self.lock()?;
        let tree = snapshot(&self.work_tree)?;
        if tree == local.head {
            return Ok(false);
        }
        local.head = tree;
        debug!(message, "Committed");
        Ok(true)
    }

    async fn push(&self) -> Result<PushOutcome> {
        let mut local = self.lock()?;
        let mut remote = self.remote.lock()?;
        if remote.version != local.base_version {
            return Ok(PushOutcome::Rejected(format!(
                "remote at version {}, local base {}",
                remote.version, local.base_version
            )));
        }
        if local.head == local.base {
            return Ok(PushOutcome::Pushed);
        }
        remote.version += 1;
        remote.files = local.head.clone();
        remote.branches.insert("main".to_string(), Utc::now());
        local.base = local.head.clone();
        local.base_version = remote.version;
        Ok(PushOutcome::Pushed)
    }

    async fn branches(&self) -> Result<Vec<BranchInfo>> {
        let remote = self.remote.lock()?;
        Ok(remote
            .branches
            .iter()
            .map(|(name, last_commit)| BranchInfo {
                name: name.clone(),
                last_commit: *last_commit,
            })
            .collect())
    }

    async fn compact(&self) -> Result<()> {
        self.remote.lock()?.compactions += 1;
        Ok(())
    }
}

/// Read every file under `root`, keyed by `/`-separated relative path
pub fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut files = Snapshot::new();
    if root.exists() {
        collect(root, root, &mut files)?;
    }
    Ok(files)
}

fn collect(root: &Path, dir: &Path, files: &mut Snapshot) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, std::fs::read(&path)?);
        }
    }
    Ok(())
}

/// Make the directory match `files` exactly
fn write_tree(root: &Path, files: &Snapshot) -> Result<()> {
    for stale in snapshot(root)?.keys().filter(|k| !files.contains_key(*k)) {
        std::fs::remove_file(root.join(stale))?;
    }
    for (path, content) in files {
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}
