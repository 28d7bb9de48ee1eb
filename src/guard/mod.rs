//! Reputation & abuse guard
//!
//! Gatekeeper for anything published to the shared repository:
//! - `reputation` - strike ledger and ban escalation
//! - `rate_limit` - hourly and daily upload windows
//! - `content` - destructive / exfiltration / obfuscation rule table
//!
//! Rejections caused by rate limits or malicious content always record
//! exactly one strike before the rejection is returned.

pub mod content;
pub mod rate_limit;
pub mod reputation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::{FixbaseError, Rejection, Result};
use crate::fixes::Timestamp;
use crate::state::StateStore;

pub use content::{ContentPolicy, ContentScanner, RuleCategory, RuleSpec};
pub use rate_limit::{RateLimits, RateWindows};
pub use reputation::{BanLedger, BanStatus, ReputationRecord, Violation, ViolationKind};

/// What a housekeeping pass cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardHousekeeping {
    pub pruned_timestamps: usize,
    pub lifted_bans: usize,
}

/// Abuse guard bound to the shared state store
pub struct AbuseGuard {
    state: Arc<StateStore>,
    limits: RateLimits,
    low_quality_threshold: f64,
    low_quality_strike_after: u32,
    content: Box<dyn ContentPolicy>,
    /// Low-quality uploads since the last spam strike, per identity.
    /// Lives as long as the guard does.
    low_quality: Mutex<HashMap<String, u32>>,
}

impl AbuseGuard {
    pub fn new(state: Arc<StateStore>, config: &GuardConfig) -> Self {
        Self {
            state,
            limits: RateLimits {
                per_hour: config.max_uploads_per_hour,
                per_day: config.max_uploads_per_day,
            },
            low_quality_threshold: config.low_quality_threshold,
            low_quality_strike_after: config.low_quality_strike_after.max(1),
            content: Box::new(ContentScanner::from_config(config.rules_file.as_deref())),
            low_quality: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a different content policy
    pub fn with_policy(mut self, policy: Box<dyn ContentPolicy>) -> Self {
        self.content = policy;
        self
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// Whether the identity is currently banned.
    ///
    /// Clears an expired temporary ban as a side effect.
    pub fn check_banned(&self, owner_id: &str) -> Result<Option<Rejection>> {
        self.check_banned_at(owner_id, Utc::now())
    }

    pub fn check_banned_at(&self, owner_id: &str, now: Timestamp) -> Result<Option<Rejection>> {
        self.state.update(|ledger: &mut BanLedger| {
            let Some(record) = ledger.records.get_mut(owner_id) else {
                return Ok(None);
            };

            match record.status(now) {
                BanStatus::Permanent => Ok(Some(Rejection::Banned {
                    reason: format!("permanently banned after {} strikes", record.strikes),
                })),
                BanStatus::TempBanned { until } => Ok(Some(Rejection::Banned {
                    reason: format!(
                        "temporarily banned for another {}",
                        reputation::format_remaining(until - now)
                    ),
                })),
                BanStatus::Clear => {
                    if record.clear_expired(now) {
                        info!(owner_id, strikes = record.strikes, "Temporary ban lifted");
                    }
                    Ok(None)
                }
            }
        })
    }

    /// Whether one more upload would break the hourly or daily ceiling
    pub fn check_rate_limit(&self, owner_id: &str) -> Result<Option<Rejection>> {
        self.check_rate_limit_at(owner_id, Utc::now())
    }

    pub fn check_rate_limit_at(&self, owner_id: &str, now: Timestamp) -> Result<Option<Rejection>> {
        let limits = self.limits;
        self.state.update(|windows: &mut RateWindows| {
            windows.prune(owner_id, now);
            Ok(windows
                .violation(owner_id, limits, now)
                .map(|reason| Rejection::RateLimited { reason }))
        })
    }

    /// Layered pattern scan of a solution
    pub fn check_malicious_content(&self, solution: &str) -> Option<Rejection> {
        self.content
            .scan(solution)
            .map(|reason| Rejection::Malicious { reason })
    }

    // =========================================================================
    // Upload gate
    // =========================================================================

    /// Admit or reject one upload.
    ///
    /// `quality` is the fix's success rate in [0, 1]. The upload timestamp
    /// is recorded only when every check passes.
    pub fn validate_upload(&self, owner_id: &str, solution: &str, quality: f64) -> Result<()> {
        self.validate_upload_at(owner_id, solution, quality, Utc::now())
    }

    pub fn validate_upload_at(
        &self,
        owner_id: &str,
        solution: &str,
        quality: f64,
        now: Timestamp,
    ) -> Result<()> {
        if let Some(rejection) = self.check_banned_at(owner_id, now)? {
            return Err(reject(owner_id, rejection));
        }

        if let Some(rejection) = self.check_rate_limit_at(owner_id, now)? {
            self.issue_strike_at(owner_id, ViolationKind::RateLimit, rejection.reason(), now)?;
            return Err(reject(owner_id, rejection));
        }

        if let Some(rejection) = self.check_malicious_content(solution) {
            self.issue_strike_at(
                owner_id,
                ViolationKind::MaliciousContent,
                rejection.reason(),
                now,
            )?;
            return Err(reject(owner_id, rejection));
        }

        if quality < self.low_quality_threshold {
            let tally = {
                let mut counts = self
                    .low_quality
                    .lock()
                    .map_err(|_| FixbaseError::LockPoisoned)?;
                let count = counts.entry(owner_id.to_string()).or_insert(0);
                *count += 1;
                let tally = *count;
                if tally >= self.low_quality_strike_after {
                    *count = 0;
                }
                tally
            };
            debug!(owner_id, tally, quality, "Low-quality upload");

            if tally >= self.low_quality_strike_after {
                let rejection = Rejection::LowQuality {
                    reason: format!(
                        "{} uploads with success rate below {:.0}%",
                        tally,
                        self.low_quality_threshold * 100.0
                    ),
                };
                self.issue_strike_at(
                    owner_id,
                    ViolationKind::LowQualitySpam,
                    rejection.reason(),
                    now,
                )?;
                return Err(reject(owner_id, rejection));
            }
        }

        self.state.update(|windows: &mut RateWindows| {
            windows.record(owner_id, now);
            Ok(())
        })?;
        debug!(owner_id, "Upload admitted");
        Ok(())
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Record a violation and escalate the identity's ban
    pub fn issue_strike(&self, owner_id: &str, kind: ViolationKind, details: &str) -> Result<BanStatus> {
        self.issue_strike_at(owner_id, kind, details, Utc::now())
    }

    pub fn issue_strike_at(
        &self,
        owner_id: &str,
        kind: ViolationKind,
        details: &str,
        now: Timestamp,
    ) -> Result<BanStatus> {
        self.state.update(|ledger: &mut BanLedger| {
            let record = ledger.records.entry(owner_id.to_string()).or_default();
            let status = record.apply_strike(Violation {
                kind,
                at: now,
                details: details.to_string(),
            });
            warn!(
                owner_id,
                violation = %kind,
                strikes = record.strikes,
                ban = ?status,
                "Strike issued"
            );
            Ok(status)
        })
    }

    pub fn reputation(&self, owner_id: &str) -> Result<ReputationRecord> {
        let ledger: BanLedger = self.state.load()?;
        Ok(ledger.records.get(owner_id).cloned().unwrap_or_default())
    }

    pub fn ledger(&self) -> Result<BanLedger> {
        self.state.load()
    }

    /// Prune rate windows and lift expired temporary bans
    pub fn housekeeping(&self) -> Result<GuardHousekeeping> {
        self.housekeeping_at(Utc::now())
    }

    pub fn housekeeping_at(&self, now: Timestamp) -> Result<GuardHousekeeping> {
        let pruned_timestamps = self
            .state
            .update(|windows: &mut RateWindows| Ok(windows.prune_all(now)))?;
        let lifted_bans = self.state.update(|ledger: &mut BanLedger| {
            Ok(ledger
                .records
                .values_mut()
                .filter(|r| !r.permanent_ban)
                .map(|r| r.clear_expired(now))
                .filter(|lifted| *lifted)
                .count())
        })?;
        Ok(GuardHousekeeping {
            pruned_timestamps,
            lifted_bans,
        })
    }
}

fn reject(owner_id: &str, rejection: Rejection) -> FixbaseError {
    info!(owner_id, %rejection, "Upload rejected");
    FixbaseError::ValidationRejected(rejection)
}
