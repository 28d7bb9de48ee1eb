//! Local fix store
//!
//! Keyed collection of fix records with relevance search over local fixes
//! and the cached public index.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use super::model::*;
use super::normalize::{fix_hash, signature_key, tokens};
use super::scoring::{rescore, search_score, similarity};
use crate::error::{FixbaseError, Result};
use crate::state::StateStore;

/// Threshold used by `get_best_fix_for_error`
pub const BEST_FIX_MIN_RELEVANCE: f64 = 0.3;

/// Age after which quarantined fixes are dropped
pub const QUARANTINE_RETENTION_DAYS: i64 = 30;

/// Input for `FixStore::add_fix`
#[derive(Debug, Clone)]
pub struct NewFix {
    pub error_type: String,
    pub error_signature: String,
    pub solution: String,
    pub fix_hash: Option<String>,
    pub context: FixContext,
    pub inspired_by: Option<String>,
    pub variation_reason: Option<String>,
}

impl NewFix {
    pub fn new(error_type: &str, error_signature: &str, solution: &str) -> Self {
        Self {
            error_type: error_type.to_string(),
            error_signature: error_signature.to_string(),
            solution: solution.to_string(),
            fix_hash: None,
            context: FixContext::new(),
            inspired_by: None,
            variation_reason: None,
        }
    }

    /// Use a precomputed hash instead of deriving one
    pub fn with_hash(mut self, fix_hash: &str) -> Self {
        self.fix_hash = Some(fix_hash.to_string());
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Mark this fix as a variation of an existing one
    pub fn inspired_by(mut self, parent_hash: &str, reason: &str) -> Self {
        self.inspired_by = Some(parent_hash.to_string());
        self.variation_reason = Some(reason.to_string());
        self
    }
}

/// Outcome of merging a pulled index into the read cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Local fix store bound to one owner identity
pub struct FixStore {
    state: Arc<StateStore>,
    owner_id: String,
}

impl FixStore {
    pub fn new(state: Arc<StateStore>, owner_id: impl Into<String>) -> Self {
        Self {
            state,
            owner_id: owner_id.into(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Insert a fix under its normalized signature key.
    ///
    /// Idempotent: a record with the same hash is never overwritten.
    pub fn add_fix(&self, fix: NewFix) -> Result<String> {
        if fix.error_signature.trim().is_empty() || fix.solution.trim().is_empty() {
            return Err(FixbaseError::InvalidInput(
                "error signature and solution must be non-empty".to_string(),
            ));
        }

        let key = signature_key(&fix.error_signature);
        let hash = fix
            .fix_hash
            .clone()
            .unwrap_or_else(|| fix_hash(&fix.error_signature, &fix.solution));
        let owner_id = self.owner_id.clone();
        let now = Utc::now();

        self.state.update(|dict: &mut FixDictionary| {
            if dict.find(&hash).is_some() {
                debug!(fix_hash = %hash, "Fix already stored");
                return Ok(());
            }

            let mut created_at = now;
            if let Some(parent_hash) = &fix.inspired_by {
                if *parent_hash == hash {
                    return Err(FixbaseError::InvalidInput(
                        "a fix cannot be inspired by itself".to_string(),
                    ));
                }
                let parent = dict
                    .find(parent_hash)
                    .or_else(|| dict.archived.get(parent_hash))
                    .ok_or_else(|| FixbaseError::NotFound(format!("parent fix {}", parent_hash)))?;
                // Children are strictly younger than their parent
                if created_at <= parent.created_at {
                    created_at = parent.created_at + Duration::milliseconds(1);
                }
            }

            let mut record = FixRecord {
                fix_hash: hash.clone(),
                error_type: fix.error_type,
                error_signature: fix.error_signature,
                solution: fix.solution,
                context: fix.context,
                owner_id,
                created_at,
                last_used: None,
                usage: UsageStats::default(),
                relevance_score: 0.0,
                lineage: Lineage {
                    inspired_by: fix.inspired_by,
                    variation_reason: fix.variation_reason,
                    merged_from: Vec::new(),
                },
                quarantined: false,
                quarantine: None,
            };
            rescore(&mut record, now);

            info!(fix_hash = %hash, key = %key, "Fix added");
            dict.entries.entry(key.clone()).or_default().push(record);
            Ok(())
        })?;

        Ok(key)
    }

    /// Rank local and cached remote fixes against a query.
    pub fn search_similar_fixes(&self, query: &str, min_relevance: f64) -> Result<Vec<RankedFix>> {
        let dict: FixDictionary = self.state.load()?;
        let cache: RemoteCache = self.state.load()?;
        let query_tokens = tokens(query);

        let mut results = Vec::new();

        for record in dict.records().filter(|r| !r.quarantined) {
            let sim = similarity(&query_tokens, &tokens(&record.error_signature));
            let rate = (record.usage.attempts > 0).then(|| record.usage.success_rate());
            let score = search_score(sim, rate);
            if score >= min_relevance {
                results.push(RankedFix {
                    fix_hash: record.fix_hash.clone(),
                    error_type: record.error_type.clone(),
                    error_signature: record.error_signature.clone(),
                    solution: Some(record.solution.clone()),
                    owner_id: record.owner_id.clone(),
                    score,
                    attempts: record.usage.attempts,
                    timestamp: record.last_used.unwrap_or(record.created_at),
                    source: FixSource::Local,
                });
            }
        }

        for remote in cache.refs.iter().filter(|r| !r.quarantined) {
            // Local copy wins over its published pointer
            if results.iter().any(|r| r.fix_hash == remote.fix_hash) {
                continue;
            }
            let sim = similarity(&query_tokens, &tokens(&remote.error_signature));
            let score = search_score(sim, remote.success_rate);
            if score >= min_relevance {
                results.push(RankedFix {
                    fix_hash: remote.fix_hash.clone(),
                    error_type: remote.error_type.clone(),
                    error_signature: remote.error_signature.clone(),
                    solution: None,
                    owner_id: remote.owner_id.clone(),
                    score,
                    attempts: remote.usage_count.unwrap_or(0),
                    timestamp: remote.timestamp,
                    source: FixSource::Remote,
                });
            }
        }

        results.sort_by(rank_order);
        debug!(query_len = query.len(), hits = results.len(), "Search complete");
        Ok(results)
    }

    /// Count an application of a fix and recompute its relevance.
    pub fn record_fix_usage(&self, fix_hash: &str, success: bool) -> Result<()> {
        let now = Utc::now();
        self.state.update(|dict: &mut FixDictionary| {
            let record = dict
                .find_mut(fix_hash)
                .ok_or_else(|| FixbaseError::NotFound(format!("fix {}", fix_hash)))?;
            record.usage.record(success);
            record.last_used = Some(now);
            rescore(record, now);
            debug!(
                fix_hash,
                success,
                attempts = record.usage.attempts,
                relevance = record.relevance_score,
                "Recorded fix usage"
            );
            Ok(())
        })
    }

    /// Top-ranked candidate above the fixed threshold.
    ///
    /// `error_type` only breaks ties between candidates ranked equal.
    pub fn get_best_fix_for_error(&self, error: &str, error_type: &str) -> Result<Option<RankedFix>> {
        let mut results = self.search_similar_fixes(error, BEST_FIX_MIN_RELEVANCE)?.into_iter();
        let Some(top) = results.next() else {
            return Ok(None);
        };
        if error_type.is_empty() || top.error_type.eq_ignore_ascii_case(error_type) {
            return Ok(Some(top));
        }
        let tied = results
            .take_while(|r| rank_order(&top, r) == Ordering::Equal)
            .find(|r| r.error_type.eq_ignore_ascii_case(error_type));
        Ok(Some(tied.unwrap_or(top)))
    }

    /// Merge a freshly pulled public index into the read cache.
    ///
    /// Local-owned fix records are never touched. Quarantine marks set
    /// locally survive a refresh that does not carry them.
    pub fn sync_with_remote(&self, pulled: Vec<RemoteRef>) -> Result<CacheSyncSummary> {
        let now = Utc::now();
        let summary = self.state.update(|cache: &mut RemoteCache| {
            let mut summary = CacheSyncSummary::default();
            let mut merged: Vec<RemoteRef> = Vec::with_capacity(pulled.len());

            for mut incoming in pulled {
                if merged.iter().any(|m| m.same_entry(&incoming)) {
                    continue;
                }
                match cache.refs.iter().find(|c| c.same_entry(&incoming)) {
                    Some(existing) => {
                        if existing.quarantined && !incoming.quarantined {
                            incoming.quarantined = true;
                            incoming.quarantine = existing.quarantine.clone();
                        }
                        if *existing != incoming {
                            summary.updated += 1;
                        }
                    }
                    None => summary.added += 1,
                }
                merged.push(incoming);
            }

            summary.removed = cache
                .refs
                .iter()
                .filter(|c| !merged.iter().any(|m| m.same_entry(c)))
                .count();

            cache.refs = merged;
            cache.last_sync = Some(now);
            Ok(summary)
        })?;

        info!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            "Remote cache refreshed"
        );
        Ok(summary)
    }

    /// Set or clear the quarantine flag on every copy of a fix.
    ///
    /// Returns how many records (local and cached) were touched.
    pub fn set_quarantine(
        &self,
        fix_hash: &str,
        quarantined: bool,
        actor: &str,
        reason: &str,
    ) -> Result<usize> {
        let now = Utc::now();
        let mark = quarantined.then(|| QuarantineMark {
            by: actor.to_string(),
            reason: reason.to_string(),
            at: now,
        });

        let local = self.state.update(|dict: &mut FixDictionary| {
            Ok(match dict.find_mut(fix_hash) {
                Some(record) => {
                    record.quarantined = quarantined;
                    record.quarantine = mark.clone();
                    rescore(record, now);
                    1
                }
                None => 0,
            })
        })?;

        let cached = self.state.update(|cache: &mut RemoteCache| {
            let mut touched = 0;
            for r in cache.refs.iter_mut().filter(|r| r.fix_hash == fix_hash) {
                r.quarantined = quarantined;
                r.quarantine = mark.clone();
                touched += 1;
            }
            Ok(touched)
        })?;

        let touched = local + cached;
        if touched == 0 {
            return Err(FixbaseError::NotFound(format!("fix {}", fix_hash)));
        }
        warn!(fix_hash, quarantined, actor, reason, "Quarantine flag changed");
        Ok(touched)
    }

    /// Look up an active fix
    pub fn get(&self, fix_hash: &str) -> Result<Option<FixRecord>> {
        let dict: FixDictionary = self.state.load()?;
        Ok(dict.find(fix_hash).cloned())
    }

    /// Look up a fix removed by the merge pass
    pub fn archived(&self, fix_hash: &str) -> Result<Option<FixRecord>> {
        let dict: FixDictionary = self.state.load()?;
        Ok(dict.archived.get(fix_hash).cloned())
    }

    /// Every active fix
    pub fn all_fixes(&self) -> Result<Vec<FixRecord>> {
        let dict: FixDictionary = self.state.load()?;
        Ok(dict.records().cloned().collect())
    }

    /// Cached public index
    pub fn remote_refs(&self) -> Result<Vec<RemoteRef>> {
        let cache: RemoteCache = self.state.load()?;
        Ok(cache.refs)
    }

    /// Recompute every stored relevance score (recency decays with time).
    pub fn rescore_all(&self) -> Result<usize> {
        let now = Utc::now();
        self.state.update(|dict: &mut FixDictionary| {
            let mut changed = 0;
            for record in dict.entries.values_mut().flat_map(|v| v.iter_mut()) {
                let before = record.relevance_score;
                rescore(record, now);
                if (before - record.relevance_score).abs() > f64::EPSILON {
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    /// Drop quarantined fixes past retention and empty keys.
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: Timestamp) -> Result<usize> {
        let cutoff = now - Duration::days(QUARANTINE_RETENTION_DAYS);
        self.state.update(|dict: &mut FixDictionary| {
            let mut dropped = 0;
            for records in dict.entries.values_mut() {
                let before = records.len();
                records.retain(|r| !(r.quarantined && r.created_at < cutoff));
                dropped += before - records.len();
            }
            dict.entries.retain(|_, records| !records.is_empty());
            if dropped > 0 {
                info!(dropped, "Expired quarantined fixes removed");
            }
            Ok(dropped)
        })
    }
}

/// Score desc, then attempts desc, then newest first
fn rank_order(a: &RankedFix, b: &RankedFix) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.attempts.cmp(&a.attempts))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}
