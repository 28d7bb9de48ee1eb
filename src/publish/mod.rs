//! Publish pipeline
//!
//! Turns a local fix into a shared one:
//! 1. promotion bar and novelty filter (otherwise the fix stays local-only)
//! 2. patch -> encrypt -> sign, all before touching the repository
//! 3. abuse guard admission
//! 4. artifact + signature written, index appended, commit, push
//!
//! A push rejected because the remote moved ahead gets exactly one
//! pull-then-retry.

pub mod crypto;
pub mod patch;
pub mod promotion;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{FixbaseError, Result};
use crate::fixes::{FixStore, RemoteRef};
use crate::guard::AbuseGuard;
use crate::vcs::{push_with_retry, PublicIndex, VersionControlBackend};

pub use crypto::{verify_signature, ArtifactCrypto, ArtifactSignature, EncryptedArtifact};
pub use patch::{create_patch, FixPatch};
pub use promotion::{NoveltyFilter, PromotionCriteria, PublishFilter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Artifact pushed; `artifact` is its path inside the repository
    Published { fix_hash: String, artifact: String },
    /// Not published, and no remote state was touched
    LocalOnly { reason: String },
}

pub struct Publisher {
    store: Arc<FixStore>,
    guard: Arc<AbuseGuard>,
    crypto: Arc<ArtifactCrypto>,
    backend: Arc<dyn VersionControlBackend>,
    index_file: String,
    artifact_dir: String,
    criteria: PromotionCriteria,
    filter: Box<dyn PublishFilter>,
}

impl Publisher {
    pub fn new(
        store: Arc<FixStore>,
        guard: Arc<AbuseGuard>,
        crypto: Arc<ArtifactCrypto>,
        backend: Arc<dyn VersionControlBackend>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            guard,
            crypto,
            backend,
            index_file: config.repository.index_file.clone(),
            artifact_dir: config.repository.artifact_dir.clone(),
            criteria: PromotionCriteria::from(&config.publish),
            filter: Box::new(NoveltyFilter),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn PublishFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Publish one local fix if it qualifies.
    ///
    /// Guard rejections come back as `ValidationRejected`; a push that is
    /// still rejected after the retry comes back as `PushRejected`.
    pub async fn publish(&self, fix_hash: &str, script_ref: Option<&str>) -> Result<PublishOutcome> {
        let record = self
            .store
            .get(fix_hash)?
            .ok_or_else(|| FixbaseError::NotFound(format!("fix {}", fix_hash)))?;

        if let Some(reason) = self.criteria.shortfall(&record) {
            debug!(fix_hash, reason = %reason, "Below promotion bar");
            return Ok(PublishOutcome::LocalOnly { reason });
        }

        let work_tree = self.backend.work_tree();
        let index_path = work_tree.join(&self.index_file);
        let mut index = PublicIndex::load(&index_path)?;
        if let Some(reason) = self.filter.keep_local(&record, &index.refs) {
            info!(fix_hash, reason = %reason, "Keeping fix local-only");
            return Ok(PublishOutcome::LocalOnly { reason });
        }

        let mut patch = create_patch(
            script_ref,
            &record.error_type,
            &record.error_signature,
            &record.solution,
            &record.context,
        )?;
        // Stored hash stays authoritative for fixes added with a precomputed one
        patch.fix_hash.clone_from(&record.fix_hash);
        let encrypted = self.crypto.encrypt(&patch)?;
        let signature = self.crypto.sign(&encrypted)?;

        let owner_id = self.store.owner_id();
        let success_rate = record.usage.success_rate();
        self.guard
            .validate_upload(owner_id, &record.solution, success_rate)?;

        let artifact = format!("{}/{}/{}.enc", self.artifact_dir, owner_id, record.fix_hash);
        let signature_path = format!("{}/{}/{}.sig", self.artifact_dir, owner_id, record.fix_hash);
        write_json(&work_tree.join(&artifact), &encrypted).await?;
        write_json(&work_tree.join(&signature_path), &signature).await?;

        index.append(RemoteRef {
            fix_hash: record.fix_hash.clone(),
            owner_id: owner_id.to_string(),
            error_type: record.error_type.clone(),
            error_signature: patch.error_signature.clone(),
            timestamp: patch.created_at,
            artifact: artifact.clone(),
            signature: signature_path,
            quality_score: Some(record.quality()),
            usage_count: Some(record.usage.attempts),
            success_rate: Some(success_rate),
            quarantined: false,
            quarantine: None,
            merged_from: Vec::new(),
        });
        index.save(&index_path)?;

        self.backend
            .commit(&format!("Publish fix {}", short_hash(&record.fix_hash)))
            .await?;
        push_with_retry(self.backend.as_ref(), &self.index_file).await?;

        info!(fix_hash = %record.fix_hash, artifact = %artifact, "Fix published");
        Ok(PublishOutcome::Published {
            fix_hash: record.fix_hash,
            artifact,
        })
    }
}

/// Load and check one published artifact from the work tree.
///
/// Returns the signature's signer so callers can match it to the ref owner.
pub fn read_verified(work_tree: &Path, entry: &RemoteRef) -> Result<(EncryptedArtifact, ArtifactSignature)> {
    let encrypted: EncryptedArtifact =
        serde_json::from_slice(&std::fs::read(work_tree.join(&entry.artifact))?)?;
    let signature: ArtifactSignature =
        serde_json::from_slice(&std::fs::read(work_tree.join(&entry.signature))?)?;

    if encrypted.fix_hash != entry.fix_hash {
        return Err(FixbaseError::Crypto(format!(
            "artifact {} does not hold fix {}",
            entry.artifact, entry.fix_hash
        )));
    }
    verify_signature(&encrypted, &signature)?;
    Ok((encrypted, signature))
}

pub(crate) fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::NewFix;
    use crate::state::StateStore;
    use crate::vcs::{MemoryBackend, MemoryRemote};
    use tempfile::TempDir;

    struct Node {
        store: Arc<FixStore>,
        publisher: Publisher,
        backend: Arc<MemoryBackend>,
    }

    fn node(remote: &Arc<MemoryRemote>, dir: &TempDir, owner: &str) -> Node {
        let config = Config::default();
        let state = Arc::new(StateStore::open_in_memory().unwrap());
        let store = Arc::new(FixStore::new(state.clone(), owner));
        let guard = Arc::new(AbuseGuard::new(state, &config.guard));
        let backend =
            Arc::new(MemoryBackend::clone_from(remote.clone(), &dir.path().join(owner)).unwrap());
        let publisher = Publisher::new(
            store.clone(),
            guard,
            Arc::new(ArtifactCrypto::ephemeral(owner)),
            backend.clone(),
            &config,
        );
        Node {
            store,
            publisher,
            backend,
        }
    }

    fn proven_fix(store: &FixStore, error: &str, solution: &str) -> String {
        store.add_fix(NewFix::new("NameError", error, solution)).unwrap();
        let hash = crate::fixes::normalize::fix_hash(error, solution);
        for _ in 0..25 {
            store.record_fix_usage(&hash, true).unwrap();
        }
        hash
    }

    #[tokio::test]
    async fn test_publish_writes_artifact_and_index() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let a = node(&remote, &dir, "cid-a");
        let hash = proven_fix(&a.store, "NameError: name 'os' is not defined", "import os");

        let artifact = match a.publisher.publish(&hash, Some("deploy.py")).await.unwrap() {
            PublishOutcome::Published { artifact, .. } => artifact,
            other => panic!("expected publish, got {:?}", other),
        };
        assert_eq!(artifact, format!("fixes/cid-a/{}.enc", hash));

        let index = PublicIndex::parse(&remote.read("index.json").unwrap().unwrap());
        assert_eq!(index.refs.len(), 1);
        assert_eq!(index.refs[0].owner_id, "cid-a");
        assert_eq!(index.refs[0].usage_count, Some(25));
        assert!(remote.read(&artifact).unwrap().is_some());

        let (_, signature) = read_verified(a.backend.work_tree(), &index.refs[0]).unwrap();
        assert_eq!(signature.signer_id, "cid-a");

        // Second attempt is not novel
        let again = a.publisher.publish(&hash, None).await.unwrap();
        assert!(matches!(again, PublishOutcome::LocalOnly { ref reason } if reason.contains("already")));
    }

    #[tokio::test]
    async fn test_unproven_fix_stays_local() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let a = node(&remote, &dir, "cid-a");
        a.store
            .add_fix(NewFix::new("KeyError", "KeyError: 'user'", "d.get('user')"))
            .unwrap();
        let hash = crate::fixes::normalize::fix_hash("KeyError: 'user'", "d.get('user')");

        let outcome = a.publisher.publish(&hash, None).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::LocalOnly { .. }));
        assert_eq!(remote.version().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_repository_untouched() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let a = node(&remote, &dir, "cid-a");
        let hash = proven_fix(&a.store, "PermissionError: denied", "rm -rf /");

        let err = a.publisher.publish(&hash, None).await.unwrap_err();
        assert!(matches!(err, FixbaseError::ValidationRejected(_)));
        assert_eq!(remote.version().unwrap(), 0);
        assert!(!a.backend.work_tree().join("index.json").exists());
    }

    #[tokio::test]
    async fn test_stale_base_pulls_once_and_retries() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let a = node(&remote, &dir, "cid-a");
        let b = node(&remote, &dir, "cid-b");

        let hash_a = proven_fix(&a.store, "NameError: name 'os' is not defined", "import os");
        let hash_b = proven_fix(&b.store, "NameError: name 'sys' is not defined", "import sys");

        b.publisher.publish(&hash_b, None).await.unwrap();
        // a's clone predates b's push
        let outcome = a.publisher.publish(&hash_a, None).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));

        let index = PublicIndex::parse(&remote.read("index.json").unwrap().unwrap());
        let hashes: Vec<_> = index.refs.iter().map(|r| r.fix_hash.as_str()).collect();
        assert_eq!(hashes, vec![hash_b.as_str(), hash_a.as_str()]);
        assert!(remote.read(&format!("fixes/cid-b/{}.sig", hash_b)).unwrap().is_some());
    }
}
