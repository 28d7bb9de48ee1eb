//! Local fix store integration tests
//!
//! Hashing, ranking and persistence through the on-disk state store.

use std::sync::Arc;

use tempfile::TempDir;

use fixbase::fixes::normalize::fix_hash;
use fixbase::fixes::FixSource;
use fixbase::{FixStore, NewFix, StateStore};

fn store_in(dir: &TempDir, owner: &str) -> FixStore {
    let state = Arc::new(StateStore::open(dir.path()).unwrap());
    FixStore::new(state, owner)
}

#[test]
fn test_same_content_same_hash_across_identities() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = store_in(&d1, "cid-a");
    let b = store_in(&d2, "cid-b");

    a.add_fix(NewFix::new(
        "ModuleNotFoundError",
        "ModuleNotFoundError: No module named 'yaml' (/home/a/app/main.py, line 3)",
        "pip install pyyaml",
    ))
    .unwrap();
    b.add_fix(NewFix::new(
        "ModuleNotFoundError",
        "ModuleNotFoundError: No module named 'yaml' (/srv/b/run.py, line 90)",
        "pip install pyyaml\n",
    ))
    .unwrap();

    let hash_a = &a.all_fixes().unwrap()[0].fix_hash;
    let hash_b = &b.all_fixes().unwrap()[0].fix_hash;
    assert_eq!(hash_a, hash_b);
}

#[test]
fn test_search_respects_threshold_and_ranking() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, "cid-a");

    let fixes = [
        ("NameError", "NameError: name 'os' is not defined", "import os"),
        ("NameError", "NameError: name 'json' is not defined", "import json"),
        ("KeyError", "KeyError: 'HOME' environment lookup", "os.environ.get('HOME')"),
        ("TimeoutError", "TimeoutError: connection timed out", "retry with backoff"),
    ];
    for (error_type, error, solution) in fixes {
        store.add_fix(NewFix::new(error_type, error, solution)).unwrap();
    }
    store
        .record_fix_usage(&fix_hash(fixes[0].1, fixes[0].2), true)
        .unwrap();

    let results = store
        .search_similar_fixes("NameError: name 'os' is not defined", 0.3)
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.score >= 0.3));
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(results[0].fix_hash, fix_hash(fixes[0].1, fixes[0].2));
    assert_eq!(results[0].source, FixSource::Local);
    assert!(results.iter().all(|r| r.error_type != "TimeoutError"));

    let best = store
        .get_best_fix_for_error("NameError: name 'json' is not defined", "NameError")
        .unwrap()
        .unwrap();
    assert_eq!(best.error_type, "NameError");
}

#[test]
fn test_success_beats_failure_from_same_state() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let hash = fix_hash("ValueError: bad literal", "int(x.strip())");

    let mut scores = Vec::new();
    for (dir, success) in [(&d1, true), (&d2, false)] {
        let store = store_in(dir, "cid-a");
        store
            .add_fix(NewFix::new("ValueError", "ValueError: bad literal", "int(x.strip())"))
            .unwrap();
        store.record_fix_usage(&hash, true).unwrap();
        store.record_fix_usage(&hash, success).unwrap();
        scores.push(store.get(&hash).unwrap().unwrap().relevance_score);
    }
    assert!(scores[0] > scores[1]);
}

#[test]
fn test_fixes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let hash = fix_hash("NameError: name 'os' is not defined", "import os");
    {
        let store = store_in(&dir, "cid-a");
        store
            .add_fix(NewFix::new("NameError", "NameError: name 'os' is not defined", "import os"))
            .unwrap();
        store.record_fix_usage(&hash, true).unwrap();
        store.set_quarantine(&hash, true, "reviewer", "suspicious").unwrap();
    }

    let store = store_in(&dir, "cid-a");
    let record = store.get(&hash).unwrap().unwrap();
    assert_eq!(record.usage.attempts, 1);
    assert!(record.quarantined);
    assert_eq!(record.quarantine.unwrap().by, "reviewer");

    // Quarantined fixes drop out of default ranking
    assert!(store
        .search_similar_fixes("NameError: name 'os' is not defined", 0.0)
        .unwrap()
        .is_empty());
}
