//! Two-node sync scenarios against an in-memory remote
//!
//! Each node runs its own daemon and publisher over a private work tree
//! cloned from the same `MemoryRemote`.

use std::sync::Arc;

use tempfile::TempDir;

use fixbase::daemon::sync::refresh_cache;
use fixbase::fixes::normalize::fix_hash;
use fixbase::fixes::FixSource;
use fixbase::vcs::{MemoryBackend, MemoryRemote, PublicIndex};
use fixbase::{
    ArtifactCrypto, Config, Job, NewFix, PublishOutcome, Publisher, StateStore, SyncDaemon,
    VersionControlBackend,
};

const ERROR: &str = "NameError: name 'os' is not defined";
const SOLUTION: &str = "import os";

struct Node {
    daemon: SyncDaemon,
    publisher: Publisher,
    backend: Arc<MemoryBackend>,
}

fn node(dir: &TempDir, remote: &Arc<MemoryRemote>, identity: &str) -> Node {
    let mut config = Config::default();
    config.node.identity = identity.to_string();
    config.sync.retry_backoff_ms = 1;

    let backend =
        Arc::new(MemoryBackend::clone_from(remote.clone(), &dir.path().join(identity)).unwrap());
    let daemon = SyncDaemon::new(
        config.clone(),
        Arc::new(StateStore::open_in_memory().unwrap()),
        backend.clone(),
    );
    let publisher = Publisher::new(
        daemon.store().clone(),
        daemon.guard().clone(),
        Arc::new(ArtifactCrypto::ephemeral(identity)),
        backend.clone(),
        &config,
    );
    Node {
        daemon,
        publisher,
        backend,
    }
}

/// Store the fix and report enough successful uses to clear promotion
fn proven(node: &Node) -> String {
    let store = node.daemon.store();
    store.add_fix(NewFix::new("NameError", ERROR, SOLUTION)).unwrap();
    let hash = fix_hash(ERROR, SOLUTION);
    for _ in 0..25 {
        store.record_fix_usage(&hash, true).unwrap();
    }
    hash
}

fn remote_index(remote: &MemoryRemote) -> PublicIndex {
    PublicIndex::parse(&remote.read("index.json").unwrap().unwrap())
}

#[tokio::test]
async fn test_concurrent_publishes_merge_into_one_ref() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    let a = node(&dir, &remote, "cid-a");
    let b = node(&dir, &remote, "cid-b");

    let hash = proven(&a);
    assert_eq!(proven(&b), hash);

    let outcome = a.publisher.publish(&hash, None).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { .. }));

    // B never pulled, so its push lands on a stale base and retries
    let outcome = b.publisher.publish(&hash, None).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { .. }));
    assert_eq!(remote_index(&remote).refs.len(), 2);

    a.daemon.run_job(Job::Pull).await.unwrap();
    a.daemon.run_job(Job::Dedup).await.unwrap();
    a.daemon.run_job(Job::Push).await.unwrap();

    let index = remote_index(&remote);
    assert_eq!(index.refs.len(), 1);
    let survivor = &index.refs[0];
    assert_eq!(survivor.fix_hash, hash);
    assert_eq!(survivor.merged_from.len(), 1);
    let merged = &survivor.merged_from[0];
    assert_eq!(merged.fix_hash, hash);
    assert_ne!(merged.owner_id, survivor.owner_id);
    assert!(["cid-a", "cid-b"].contains(&merged.owner_id.as_str()));

    assert_eq!(a.daemon.stats().unwrap().refs_merged, 1);

    // Nothing left to merge
    a.daemon.run_job(Job::Dedup).await.unwrap();
    assert_eq!(a.daemon.stats().unwrap().refs_merged, 1);
    assert_eq!(remote_index(&remote).refs.len(), 1);
}

#[tokio::test]
async fn test_pulled_refs_are_searchable_without_solution() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    let a = node(&dir, &remote, "cid-a");
    let b = node(&dir, &remote, "cid-b");

    let hash = proven(&a);
    a.publisher.publish(&hash, None).await.unwrap();

    let summary = b.daemon.pull().await.unwrap();
    assert_eq!(summary.cache.added, 1);
    assert_eq!(summary.rejected, 0);

    let hits = b
        .daemon
        .store()
        .search_similar_fixes("NameError: name 'os' is not defined", 0.3)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fix_hash, hash);
    assert_eq!(hits[0].source, FixSource::Remote);
    assert_eq!(hits[0].owner_id, "cid-a");
    assert!(hits[0].solution.is_none());
}

#[tokio::test]
async fn test_tampered_artifact_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    let a = node(&dir, &remote, "cid-a");
    let b = node(&dir, &remote, "cid-b");

    let hash = proven(&a);
    a.publisher.publish(&hash, None).await.unwrap();
    b.daemon.pull().await.unwrap();

    let work_tree = b.backend.work_tree();
    let artifact_path = work_tree.join(format!("fixes/cid-a/{}.enc", hash));
    let mut artifact: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&artifact_path).unwrap()).unwrap();
    artifact["ciphertext"] = serde_json::Value::String("AAAAAAAAAAAAAAAAAAAAAA==".to_string());
    std::fs::write(&artifact_path, serde_json::to_vec_pretty(&artifact).unwrap()).unwrap();

    let (summary, rejected) = refresh_cache(b.daemon.store(), work_tree, "index.json").unwrap();
    assert_eq!(rejected, 1);
    assert_eq!(summary.added, 0);
    assert!(b.daemon.store().remote_refs().unwrap().is_empty());
}

#[tokio::test]
async fn test_ref_owner_must_match_signature_signer() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::new();
    let a = node(&dir, &remote, "cid-a");
    let b = node(&dir, &remote, "cid-b");

    let hash = proven(&a);
    a.publisher.publish(&hash, None).await.unwrap();
    b.daemon.pull().await.unwrap();

    // Re-attribute the intact artifact to another owner
    let work_tree = b.backend.work_tree();
    let index_path = work_tree.join("index.json");
    let mut index = PublicIndex::load(&index_path).unwrap();
    index.refs[0].owner_id = "cid-c".to_string();
    index.save(&index_path).unwrap();

    let (_, rejected) = refresh_cache(b.daemon.store(), work_tree, "index.json").unwrap();
    assert_eq!(rejected, 1);
    assert!(b.daemon.store().remote_refs().unwrap().is_empty());
}
