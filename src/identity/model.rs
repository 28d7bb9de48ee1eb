//! Consensus-ID pool, request queue and identity bindings

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::fixes::Timestamp;
use crate::state::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStatus {
    Available,
    PendingConfirmation,
    Confirmed,
}

/// Anonymized identity token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusId {
    pub id: String,
    pub status: IdStatus,
    pub created_at: Timestamp,
    /// External identity currently holding this id
    #[serde(default)]
    pub holder: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    #[default]
    Unverified,
    Verified,
}

/// External identity <-> consensus id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub identity: String,
    pub consensus_id: String,
    #[serde(default)]
    pub verification_level: VerificationLevel,
    /// Only ever true for verified bindings
    #[serde(default)]
    pub can_edit_repos: bool,
    pub bound_at: Timestamp,
    #[serde(default)]
    pub confirmed: bool,
}

/// Request waiting for an available id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub identity: String,
    pub requested_at: Timestamp,
}

/// Message owed to an identity whose id was reassigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub identity: String,
    pub old_id: String,
    pub new_id: String,
    pub reason: String,
    pub created_at: Timestamp,
}

/// Result of a link request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Bound immediately, awaiting confirmation
    Assigned { consensus_id: String },
    /// Pool empty or sync budget spent; 1-based queue position
    Queued { position: usize, estimated_wait_secs: u64 },
}

/// Persisted issuer state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuerState {
    /// Available ids, handed out front first
    #[serde(default)]
    pub pool: VecDeque<ConsensusId>,
    /// Ids that left the pool, by id
    #[serde(default)]
    pub issued: BTreeMap<String, ConsensusId>,
    #[serde(default)]
    pub queue: VecDeque<LinkRequest>,
    /// Bindings by external identity
    #[serde(default)]
    pub bindings: BTreeMap<String, IdentityBinding>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub last_replenish_sync: Option<Timestamp>,
}

impl Document for IssuerState {
    const NAME: &'static str = "issuer";
}

impl IssuerState {
    pub fn queue_position(&self, identity: &str) -> Option<usize> {
        self.queue
            .iter()
            .position(|r| r.identity == identity)
            .map(|i| i + 1)
    }
}
