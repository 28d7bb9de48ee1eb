//! Pull and push cycles

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fixes::{CacheSyncSummary, FixStore};
use crate::publish::read_verified;
use crate::vcs::{pull_resolving, push_with_retry, PublicIndex, PullReport, VersionControlBackend};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub report: PullReport,
    pub cache: CacheSyncSummary,
    /// Refs left out of the cache because their artifact failed verification
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub committed: bool,
    /// Set when the push needed a pull first
    pub pulled: Option<PullReport>,
}

/// Pull with conflict resolution, then refresh the remote cache
pub async fn pull(
    backend: &dyn VersionControlBackend,
    store: &FixStore,
    index_file: &str,
) -> Result<PullSummary> {
    let report = pull_resolving(backend, index_file).await?;
    let (cache, rejected) = refresh_cache(store, backend.work_tree(), index_file)?;
    Ok(PullSummary {
        report,
        cache,
        rejected,
    })
}

/// Load the index from the work tree and hand every ref whose artifact
/// verifies to the store.
///
/// Verification proves the artifact is intact and was signed by the key
/// its signature file names, and that the file names the ref's owner. It
/// does not prove who holds that key: owner keys are not pinned anywhere.
pub fn refresh_cache(
    store: &FixStore,
    work_tree: &Path,
    index_file: &str,
) -> Result<(CacheSyncSummary, usize)> {
    let index = PublicIndex::load(&work_tree.join(index_file))?;
    let total = index.refs.len();

    let verified: Vec<_> = index
        .refs
        .into_iter()
        .filter(|entry| match read_verified(work_tree, entry) {
            Ok((_, signature)) if signature.signer_id == entry.owner_id => true,
            Ok((_, signature)) => {
                warn!(
                    fix_hash = %entry.fix_hash,
                    owner_id = %entry.owner_id,
                    signer_id = %signature.signer_id,
                    "Artifact signed by someone other than its owner, skipping"
                );
                false
            }
            Err(e) => {
                warn!(fix_hash = %entry.fix_hash, error = %e, "Artifact failed verification, skipping");
                false
            }
        })
        .collect();

    let rejected = total - verified.len();
    let summary = store.sync_with_remote(verified)?;
    Ok((summary, rejected))
}

/// Commit whatever the work tree holds and push it
pub async fn push(backend: &dyn VersionControlBackend, index_file: &str) -> Result<PushSummary> {
    let message = format!("fixbase sync {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
    let committed = backend.commit(&message).await?;
    let pulled = push_with_retry(backend, index_file).await?;
    debug!(committed, pulled = pulled.is_some(), "Push cycle done");
    Ok(PushSummary { committed, pulled })
}

/// Run `op`, retrying once after `backoff` if it failed transiently
pub async fn retry_once<T, F, Fut>(what: &str, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(op = what, error = %e, backoff_ms = backoff.as_millis() as u64, "Transient failure, retrying once");
            tokio::time::sleep(backoff).await;
            let result = op().await;
            if result.is_ok() {
                info!(op = what, "Retry succeeded");
            }
            result
        }
        other => other,
    }
}
