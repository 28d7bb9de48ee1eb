//! Consensus-ID issuer
//!
//! Per request: Requested -> Assigned (pending confirmation) | Queued -> Confirmed.
//! The pool is topped back up to its floor after every issuance, limited
//! to one replenishment sync per interval.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use super::model::*;
use crate::config::IssuerConfig;
use crate::error::{FixbaseError, Result};
use crate::fixes::Timestamp;
use crate::state::StateStore;

pub const DUPLICATE_ID_REASON: &str = "consensus id already confirmed for another identity";

/// Issuer service bound to the shared state store
pub struct ConsensusIdIssuer {
    state: Arc<StateStore>,
    pool_floor: usize,
    replenish_interval: Duration,
    wait_per_position_secs: u64,
}

impl ConsensusIdIssuer {
    pub fn new(state: Arc<StateStore>, config: &IssuerConfig) -> Self {
        Self {
            state,
            pool_floor: config.pool_floor,
            replenish_interval: Duration::seconds(config.replenish_interval_secs as i64),
            wait_per_position_secs: config.wait_per_position_secs,
        }
    }

    /// Run a mutation against issuer state, seeding a brand-new pool first
    fn with_state<R>(
        &self,
        now: Timestamp,
        f: impl FnOnce(&mut IssuerState) -> Result<R>,
    ) -> Result<R> {
        let floor = self.pool_floor;
        self.state.update(|state: &mut IssuerState| {
            if state.pool.is_empty() && state.issued.is_empty() && state.last_replenish_sync.is_none() {
                fill_pool(state, floor, now);
                info!(size = state.pool.len(), "Consensus id pool seeded");
            }
            f(state)
        })
    }

    fn sync_allowed(&self, state: &IssuerState, now: Timestamp) -> bool {
        match state.last_replenish_sync {
            Some(last) => now - last >= self.replenish_interval,
            None => true,
        }
    }

    fn replenish(&self, state: &mut IssuerState, now: Timestamp) {
        let minted = fill_pool(state, self.pool_floor, now);
        state.last_replenish_sync = Some(now);
        debug!(minted, size = state.pool.len(), "Pool replenished");
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Bind an external identity to a consensus id, or queue the request.
    pub fn request_link(&self, identity: &str) -> Result<LinkOutcome> {
        self.request_link_at(identity, Utc::now())
    }

    pub fn request_link_at(&self, identity: &str, now: Timestamp) -> Result<LinkOutcome> {
        self.with_state(now, |state| {
            if state.bindings.contains_key(identity) {
                return Err(FixbaseError::AlreadyLinked(identity.to_string()));
            }

            if let Some(position) = state.queue_position(identity) {
                return Ok(self.queued(position));
            }

            if !state.pool.is_empty() && self.sync_allowed(state, now) {
                let consensus_id = assign_next(state, identity, now)?;
                self.replenish(state, now);
                info!(identity, consensus_id = %consensus_id, "Consensus id assigned");
                return Ok(LinkOutcome::Assigned { consensus_id });
            }

            state.queue.push_back(LinkRequest {
                identity: identity.to_string(),
                requested_at: now,
            });
            let position = state.queue.len();
            info!(identity, position, "Link request queued");
            Ok(self.queued(position))
        })
    }

    fn queued(&self, position: usize) -> LinkOutcome {
        LinkOutcome::Queued {
            position,
            estimated_wait_secs: position as u64 * self.wait_per_position_secs,
        }
    }

    /// Drain queued requests while ids are available and the sync budget allows.
    ///
    /// Returns the (identity, consensus id) pairs assigned.
    pub fn process_queue(&self) -> Result<Vec<(String, String)>> {
        self.process_queue_at(Utc::now())
    }

    pub fn process_queue_at(&self, now: Timestamp) -> Result<Vec<(String, String)>> {
        self.with_state(now, |state| {
            if state.queue.is_empty() || state.pool.is_empty() || !self.sync_allowed(state, now) {
                return Ok(Vec::new());
            }

            let mut assigned = Vec::new();
            while !state.pool.is_empty() {
                let Some(request) = state.queue.pop_front() else {
                    break;
                };
                // Linked through another path while waiting
                if state.bindings.contains_key(&request.identity) {
                    continue;
                }
                let id = assign_next(state, &request.identity, now)?;
                assigned.push((request.identity, id));
            }

            self.replenish(state, now);
            info!(
                assigned = assigned.len(),
                still_queued = state.queue.len(),
                "Link queue processed"
            );
            Ok(assigned)
        })
    }

    /// Bind an identity to an id it already holds elsewhere.
    ///
    /// An id still in the pool leaves it. An id pending confirmation for
    /// someone else is refused. An id confirmed for someone else is bound
    /// and then reassigned by `confirm`.
    pub fn claim(&self, identity: &str, consensus_id: &str) -> Result<()> {
        let now = Utc::now();
        self.with_state(now, |state| {
            if state.bindings.contains_key(identity) {
                return Err(FixbaseError::AlreadyLinked(identity.to_string()));
            }

            if let Some(pos) = state.pool.iter().position(|id| id.id == consensus_id) {
                if let Some(mut id) = state.pool.remove(pos) {
                    id.status = IdStatus::PendingConfirmation;
                    id.holder = Some(identity.to_string());
                    state.issued.insert(id.id.clone(), id);
                }
                if self.sync_allowed(state, now) {
                    self.replenish(state, now);
                }
            } else {
                let existing = state
                    .issued
                    .get(consensus_id)
                    .ok_or_else(|| FixbaseError::NotFound(format!("consensus id {}", consensus_id)))?;
                if existing.status == IdStatus::PendingConfirmation
                    && existing.holder.as_deref() != Some(identity)
                {
                    return Err(FixbaseError::InvalidInput(format!(
                        "consensus id {} is pending confirmation for another identity",
                        consensus_id
                    )));
                }
            }

            state.bindings.insert(
                identity.to_string(),
                IdentityBinding {
                    identity: identity.to_string(),
                    consensus_id: consensus_id.to_string(),
                    verification_level: VerificationLevel::Unverified,
                    can_edit_repos: false,
                    bound_at: now,
                    confirmed: false,
                },
            );
            debug!(identity, consensus_id, "Consensus id claimed");
            Ok(())
        })
    }

    /// Finalize an identity's binding. Returns the confirmed id, which
    /// differs from the bound one if a collision forced a reassignment.
    pub fn confirm(&self, identity: &str) -> Result<String> {
        self.confirm_at(identity, Utc::now())
    }

    pub fn confirm_at(&self, identity: &str, now: Timestamp) -> Result<String> {
        self.with_state(now, |state| {
            let bound_id = state
                .bindings
                .get(identity)
                .map(|b| b.consensus_id.clone())
                .ok_or_else(|| FixbaseError::NotFound(format!("binding for {}", identity)))?;

            let final_id = detect_duplicate(state, &bound_id, identity, now)?.unwrap_or(bound_id);

            if let Some(id) = state.issued.get_mut(&final_id) {
                id.status = IdStatus::Confirmed;
                id.holder = Some(identity.to_string());
            }
            if let Some(binding) = state.bindings.get_mut(identity) {
                binding.confirmed = true;
            }
            info!(identity, consensus_id = %final_id, "Consensus id confirmed");
            Ok(final_id)
        })
    }

    /// Reassign `identity` if `consensus_id` is already confirmed for someone else.
    ///
    /// Returns the freshly minted id when a reassignment happened.
    pub fn detect_duplicate_id(&self, consensus_id: &str, identity: &str) -> Result<Option<String>> {
        let now = Utc::now();
        self.with_state(now, |state| detect_duplicate(state, consensus_id, identity, now))
    }

    /// Raise a binding to verified, which unlocks repository edits.
    pub fn upgrade_to_verified(&self, identity: &str) -> Result<IdentityBinding> {
        self.with_state(Utc::now(), |state| {
            let binding = state
                .bindings
                .get_mut(identity)
                .ok_or_else(|| FixbaseError::NotFound(format!("binding for {}", identity)))?;
            binding.verification_level = VerificationLevel::Verified;
            binding.can_edit_repos = true;
            info!(identity, consensus_id = %binding.consensus_id, "Identity verified");
            Ok(binding.clone())
        })
    }

    pub fn binding(&self, identity: &str) -> Result<Option<IdentityBinding>> {
        let state: IssuerState = self.state.load()?;
        Ok(state.bindings.get(identity).cloned())
    }

    pub fn pending_notifications(&self) -> Result<Vec<Notification>> {
        let state: IssuerState = self.state.load()?;
        Ok(state.notifications)
    }

    /// Hand notifications over for delivery, removing them from state
    pub fn take_notifications(&self) -> Result<Vec<Notification>> {
        self.state
            .update(|state: &mut IssuerState| Ok(std::mem::take(&mut state.notifications)))
    }

    /// (available ids, queued requests)
    pub fn pool_stats(&self) -> Result<(usize, usize)> {
        self.with_state(Utc::now(), |state| Ok((state.pool.len(), state.queue.len())))
    }
}

fn mint_id(now: Timestamp) -> ConsensusId {
    ConsensusId {
        id: format!("cid-{}", uuid::Uuid::new_v4().simple()),
        status: IdStatus::Available,
        created_at: now,
        holder: None,
    }
}

fn fill_pool(state: &mut IssuerState, floor: usize, now: Timestamp) -> usize {
    let mut minted = 0;
    while state.pool.len() < floor {
        state.pool.push_back(mint_id(now));
        minted += 1;
    }
    minted
}

fn assign_next(state: &mut IssuerState, identity: &str, now: Timestamp) -> Result<String> {
    let mut id = state
        .pool
        .pop_front()
        .ok_or_else(|| FixbaseError::NotFound("available consensus id".to_string()))?;
    id.status = IdStatus::PendingConfirmation;
    id.holder = Some(identity.to_string());
    let consensus_id = id.id.clone();
    state.issued.insert(consensus_id.clone(), id);
    state.bindings.insert(
        identity.to_string(),
        IdentityBinding {
            identity: identity.to_string(),
            consensus_id: consensus_id.clone(),
            verification_level: VerificationLevel::Unverified,
            can_edit_repos: false,
            bound_at: now,
            confirmed: false,
        },
    );
    Ok(consensus_id)
}

fn detect_duplicate(
    state: &mut IssuerState,
    consensus_id: &str,
    identity: &str,
    now: Timestamp,
) -> Result<Option<String>> {
    let taken = state.issued.get(consensus_id).is_some_and(|id| {
        id.status == IdStatus::Confirmed && id.holder.as_deref() != Some(identity)
    });
    if !taken {
        return Ok(None);
    }

    let mut fresh = mint_id(now);
    fresh.status = IdStatus::PendingConfirmation;
    fresh.holder = Some(identity.to_string());
    let new_id = fresh.id.clone();
    state.issued.insert(new_id.clone(), fresh);

    let binding = state
        .bindings
        .entry(identity.to_string())
        .or_insert_with(|| IdentityBinding {
            identity: identity.to_string(),
            consensus_id: consensus_id.to_string(),
            verification_level: VerificationLevel::Unverified,
            can_edit_repos: false,
            bound_at: now,
            confirmed: false,
        });
    binding.consensus_id = new_id.clone();
    binding.bound_at = now;
    binding.confirmed = false;

    state.notifications.push(Notification {
        identity: identity.to_string(),
        old_id: consensus_id.to_string(),
        new_id: new_id.clone(),
        reason: DUPLICATE_ID_REASON.to_string(),
        created_at: now,
    });
    warn!(identity, old_id = consensus_id, new_id = %new_id, "Duplicate consensus id reassigned");
    Ok(Some(new_id))
}
