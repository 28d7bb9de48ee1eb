//! Consensus-ID issuance
//!
//! Binds external identities to anonymized consensus ids drawn from a
//! pre-generated pool. Independent of the fix store.

pub mod issuer;
pub mod model;

pub use issuer::ConsensusIdIssuer;
pub use model::{
    ConsensusId, IdStatus, IdentityBinding, IssuerState, LinkOutcome, LinkRequest, Notification,
    VerificationLevel,
};
