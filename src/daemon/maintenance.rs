//! Idle-time maintenance passes
//!
//! Pure functions over the fix dictionary and the public index, so the
//! daemon decides when to persist and commit:
//! - `dedup_merge_fixes` / `dedup_merge_refs` - collapse duplicates into one survivor
//! - `cleanup_refs` - drop expired quarantined refs and exact duplicates
//! - `reorganize` - classify publishing identities by quality
//! - `stale_branches` - report idle remote branches

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fixes::normalize::group_key;
use crate::fixes::scoring::{relevance_score, rescore, NEUTRAL_SUCCESS_RATE};
use crate::fixes::store::QUARANTINE_RETENTION_DAYS;
use crate::fixes::{FixDictionary, FixRecord, MergedFix, RemoteRef, Timestamp, UsageStats};
use crate::guard::{BanLedger, ViolationKind};
use crate::vcs::BranchInfo;

// =============================================================================
// Dedup / merge
// =============================================================================

/// Merge duplicate local fixes.
///
/// Non-quarantined fixes are grouped by `group_key` of their signature.
/// In every group with more than one member the best-scoring fix survives;
/// the others are recorded in its `merged_from` and moved to the archive.
/// Returns the number of fixes merged away; a second run returns 0.
pub fn dedup_merge_fixes(dict: &mut FixDictionary, now: Timestamp) -> usize {
    for record in dict.entries.values_mut().flat_map(|v| v.iter_mut()) {
        rescore(record, now);
    }

    let mut groups: BTreeMap<String, Vec<&FixRecord>> = BTreeMap::new();
    for record in dict.records().filter(|r| !r.quarantined) {
        groups
            .entry(group_key(&record.error_signature))
            .or_default()
            .push(record);
    }

    // survivor hash -> losers
    let mut plan: Vec<(String, Vec<String>)> = Vec::new();
    for members in groups.into_values().filter(|m| m.len() > 1) {
        let Some(survivor) = members.iter().copied().max_by(|a, b| fix_order(a, b)) else {
            continue;
        };
        let losers = members
            .iter()
            .filter(|r| r.fix_hash != survivor.fix_hash)
            .map(|r| r.fix_hash.clone())
            .collect();
        plan.push((survivor.fix_hash.clone(), losers));
    }

    let mut merged = 0;
    for (survivor_hash, losers) in plan {
        let doomed: BTreeSet<&str> = losers.iter().map(String::as_str).collect();
        let mut removed = Vec::new();
        for records in dict.entries.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(records)
                .into_iter()
                .partition(|r| doomed.contains(r.fix_hash.as_str()));
            *records = kept;
            removed.extend(gone);
        }

        let Some(survivor) = dict.find_mut(&survivor_hash) else {
            continue;
        };
        for loser in &removed {
            survivor.lineage.merged_from.push(MergedFix {
                fix_hash: loser.fix_hash.clone(),
                owner_id: loser.owner_id.clone(),
                merged_at: now,
            });
            survivor
                .lineage
                .merged_from
                .extend(loser.lineage.merged_from.iter().cloned());
            debug!(survivor = %survivor_hash, loser = %loser.fix_hash, "Fix merged");
        }

        merged += removed.len();
        for loser in removed {
            dict.archived.insert(loser.fix_hash.clone(), loser);
        }
    }

    dict.entries.retain(|_, records| !records.is_empty());
    if merged > 0 {
        info!(merged, "Duplicate fixes merged");
    }
    merged
}

/// Merge duplicate refs in the public index, same policy as
/// `dedup_merge_fixes`. Merged-away refs are recorded as
/// `{fix_hash, owner_id}` on the survivor, preserving attribution.
pub fn dedup_merge_refs(refs: &mut Vec<RemoteRef>, now: Timestamp) -> usize {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, r) in refs.iter().enumerate() {
        if r.quarantined || r.error_signature.is_empty() {
            continue;
        }
        groups.entry(group_key(&r.error_signature)).or_default().push(i);
    }

    let mut doomed: BTreeSet<usize> = BTreeSet::new();
    let mut additions: Vec<(usize, Vec<MergedFix>)> = Vec::new();
    for members in groups.into_values().filter(|m| m.len() > 1) {
        let Some(&survivor) = members
            .iter()
            .max_by(|&&a, &&b| ref_order(&refs[a], &refs[b], now))
        else {
            continue;
        };

        let mut records = Vec::new();
        for &i in members.iter().filter(|&&i| i != survivor) {
            let loser = &refs[i];
            // Exact copies of the survivor add no attribution
            if !loser.same_entry(&refs[survivor]) {
                records.push(MergedFix {
                    fix_hash: loser.fix_hash.clone(),
                    owner_id: loser.owner_id.clone(),
                    merged_at: now,
                });
            }
            records.extend(loser.merged_from.iter().cloned());
            doomed.insert(i);
        }
        additions.push((survivor, records));
    }

    for (survivor, records) in additions {
        refs[survivor].merged_from.extend(records);
    }

    let merged = doomed.len();
    let mut i = 0;
    refs.retain(|_| {
        let keep = !doomed.contains(&i);
        i += 1;
        keep
    });

    if merged > 0 {
        info!(merged, remaining = refs.len(), "Duplicate refs merged");
    }
    merged
}

/// Best first when used with `max_by`: relevance, then usage, then the
/// older fix, then the smaller hash.
fn fix_order(a: &FixRecord, b: &FixRecord) -> Ordering {
    a.relevance_score
        .partial_cmp(&b.relevance_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.usage.attempts.cmp(&b.usage.attempts))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.fix_hash.cmp(&a.fix_hash))
}

fn ref_order(a: &RemoteRef, b: &RemoteRef, now: Timestamp) -> Ordering {
    ref_relevance(a, now)
        .partial_cmp(&ref_relevance(b, now))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.usage_count.unwrap_or(0).cmp(&b.usage_count.unwrap_or(0)))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.owner_id.cmp(&a.owner_id))
        .then_with(|| b.fix_hash.cmp(&a.fix_hash))
}

/// Same blend as a local fix, rebuilt from the published counters
fn ref_relevance(r: &RemoteRef, now: Timestamp) -> f64 {
    let attempts = r.usage_count.unwrap_or(0);
    let rate = r.success_rate.unwrap_or(NEUTRAL_SUCCESS_RATE).clamp(0.0, 1.0);
    let usage = UsageStats {
        attempts,
        successes: (rate * attempts as f64).round() as u64,
    };
    relevance_score(&usage, r.timestamp, r.quarantined, now)
}

// =============================================================================
// Cleanup
// =============================================================================

/// Drop quarantined refs past retention and exact duplicates (same hash
/// and owner, first copy kept). Returns how many refs were removed.
pub fn cleanup_refs(refs: &mut Vec<RemoteRef>, now: Timestamp) -> usize {
    let cutoff = now - Duration::days(QUARANTINE_RETENTION_DAYS);
    let before = refs.len();

    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    refs.retain(|r| {
        if r.quarantined && r.timestamp < cutoff {
            return false;
        }
        seen.insert((r.fix_hash.clone(), r.owner_id.clone()))
    });

    let removed = before - refs.len();
    if removed > 0 {
        info!(removed, "Public index cleaned");
    }
    removed
}

// =============================================================================
// Reorganize
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    HighQuality,
    LowQuality,
    Neutral,
}

/// Classification of one publishing identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClass {
    pub class: QualityClass,
    /// Low-quality identities are flagged, never banned from here
    pub flagged_for_review: bool,
    pub success_rate: f64,
    pub spam_rate: f64,
    pub fixes: usize,
}

pub const HIGH_QUALITY_MIN_FIXES: usize = 3;

/// Classify every identity seen in the index or the ban ledger.
///
/// - high quality: at least 3 fixes, success rate > 0.7, spam rate < 0.05
/// - low quality: success rate < 0.3 or spam rate > 0.2
///
/// The spam rate is spam and malicious-content violations per fix.
pub fn reorganize(refs: &[RemoteRef], ledger: &BanLedger) -> BTreeMap<String, IdentityClass> {
    let mut owners: BTreeMap<&str, Vec<&RemoteRef>> = BTreeMap::new();
    for r in refs {
        owners.entry(r.owner_id.as_str()).or_default().push(r);
    }
    for owner in ledger.records.keys() {
        owners.entry(owner.as_str()).or_default();
    }

    let mut classes = BTreeMap::new();
    for (owner, fixes) in owners {
        let rates: Vec<f64> = fixes.iter().filter_map(|r| r.success_rate).collect();
        let success_rate = if rates.is_empty() {
            NEUTRAL_SUCCESS_RATE
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        let spam = ledger
            .records
            .get(owner)
            .map(|rec| {
                rec.count(ViolationKind::LowQualitySpam) + rec.count(ViolationKind::MaliciousContent)
            })
            .unwrap_or(0);
        let spam_rate = spam as f64 / fixes.len().max(1) as f64;

        let class = if fixes.len() >= HIGH_QUALITY_MIN_FIXES
            && success_rate > 0.7
            && spam_rate < 0.05
        {
            QualityClass::HighQuality
        } else if success_rate < 0.3 || spam_rate > 0.2 {
            QualityClass::LowQuality
        } else {
            QualityClass::Neutral
        };

        classes.insert(
            owner.to_string(),
            IdentityClass {
                class,
                flagged_for_review: class == QualityClass::LowQuality,
                success_rate,
                spam_rate,
                fixes: fixes.len(),
            },
        );
    }

    let flagged = classes.values().filter(|c| c.flagged_for_review).count();
    info!(identities = classes.len(), flagged, "Identities reorganized");
    classes
}

// =============================================================================
// Branch scan
// =============================================================================

/// Branches whose last commit is older than `max_age_days`. Report only.
pub fn stale_branches(branches: &[BranchInfo], max_age_days: i64, now: Timestamp) -> Vec<String> {
    let cutoff = now - Duration::days(max_age_days);
    branches
        .iter()
        .filter(|b| b.last_commit < cutoff)
        .map(|b| b.name.clone())
        .collect()
}
