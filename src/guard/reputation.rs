//! Strike ledger and ban state machine
//!
//! Clean -> Strike1 (24h ban) -> Strike2 (7d ban) -> permanent ban.
//! A temporary ban lifts on its own once it expires; strikes never do.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::fixes::Timestamp;
use crate::state::Document;

/// Strikes at which an identity is banned for good
pub const PERMANENT_BAN_STRIKES: u32 = 3;

/// What an identity did to earn a strike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RateLimit,
    MaliciousContent,
    LowQualitySpam,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::RateLimit => "rate_limit",
            ViolationKind::MaliciousContent => "malicious_content",
            ViolationKind::LowQualitySpam => "low_quality_spam",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub at: Timestamp,
    pub details: String,
}

/// Current ban state of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    Clear,
    TempBanned { until: Timestamp },
    Permanent,
}

/// Per-identity reputation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    #[serde(default)]
    pub strikes: u32,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub temp_ban_until: Option<Timestamp>,
    #[serde(default)]
    pub permanent_ban: bool,
}

impl ReputationRecord {
    /// Ban length for the given strike count, `None` once permanent
    pub fn ban_duration(strikes: u32) -> Option<Duration> {
        match strikes {
            s if s >= PERMANENT_BAN_STRIKES => None,
            2 => Some(Duration::days(7)),
            _ => Some(Duration::hours(24)),
        }
    }

    /// Record a violation and escalate the ban.
    pub fn apply_strike(&mut self, violation: Violation) -> BanStatus {
        let now = violation.at;
        self.strikes += 1;
        self.violations.push(violation);

        match Self::ban_duration(self.strikes) {
            Some(duration) => {
                // Replaces any window still running
                let until = now + duration;
                self.temp_ban_until = Some(until);
                BanStatus::TempBanned { until }
            }
            None => {
                self.permanent_ban = true;
                self.temp_ban_until = None;
                BanStatus::Permanent
            }
        }
    }

    pub fn status(&self, now: Timestamp) -> BanStatus {
        if self.permanent_ban {
            return BanStatus::Permanent;
        }
        match self.temp_ban_until {
            Some(until) if now <= until => BanStatus::TempBanned { until },
            _ => BanStatus::Clear,
        }
    }

    /// Drop an expired temporary ban. Returns true if one was lifted.
    pub fn clear_expired(&mut self, now: Timestamp) -> bool {
        match self.temp_ban_until {
            Some(until) if now > until => {
                self.temp_ban_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }
}

/// All reputation records, keyed by owner id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanLedger {
    #[serde(default)]
    pub records: BTreeMap<String, ReputationRecord>,
}

impl Document for BanLedger {
    const NAME: &'static str = "ban_ledger";
}

/// Human-readable remaining time, e.g. "23h 59m"
pub fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else {
        format!("{}h {}m", hours, mins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn violation(kind: ViolationKind, at: Timestamp) -> Violation {
        Violation {
            kind,
            at,
            details: "test".to_string(),
        }
    }

    #[test]
    fn test_strike_escalation() {
        let now = Utc::now();
        let mut record = ReputationRecord::default();

        assert_eq!(
            record.apply_strike(violation(ViolationKind::LowQualitySpam, now)),
            BanStatus::TempBanned { until: now + Duration::hours(24) }
        );
        assert_eq!(
            record.apply_strike(violation(ViolationKind::RateLimit, now)),
            BanStatus::TempBanned { until: now + Duration::days(7) }
        );
        assert_eq!(
            record.apply_strike(violation(ViolationKind::MaliciousContent, now)),
            BanStatus::Permanent
        );
        assert!(record.permanent_ban);
        assert_eq!(record.strikes, 3);
        assert!(record.temp_ban_until.is_none());
    }

    #[test]
    fn test_temp_ban_expires_but_strikes_stay() {
        let now = Utc::now();
        let mut record = ReputationRecord::default();
        record.apply_strike(violation(ViolationKind::RateLimit, now));

        assert!(matches!(record.status(now), BanStatus::TempBanned { .. }));
        let later = now + Duration::hours(25);
        assert_eq!(record.status(later), BanStatus::Clear);
        assert!(record.clear_expired(later));
        assert!(!record.clear_expired(later));
        assert_eq!(record.strikes, 1);
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::minutes(90)), "1h 30m");
        assert_eq!(format_remaining(Duration::hours(50)), "2d 2h");
        assert_eq!(format_remaining(Duration::seconds(-5)), "0h 0m");
    }
}
