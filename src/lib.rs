//! fixbase: local-first fix knowledge base
//!
//! Records which solution fixed which error, ranks candidates for new
//! errors, and shares proven fixes through a version-controlled remote:
//! - `fixes` - local fix store, normalization and scoring
//! - `guard` - reputation, rate limits and content rules for uploads
//! - `publish` - promotion, patch/encrypt/sign, publication
//! - `vcs` - shared repository backend and public index
//! - `daemon` - scheduled pull/push and maintenance jobs
//! - `identity` - consensus-id pool, queue and bindings

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fixes;
pub mod guard;
pub mod identity;
pub mod logging;
pub mod publish;
pub mod state;
pub mod vcs;

pub use config::Config;
pub use daemon::{DaemonHandle, Job, SyncDaemon};
pub use error::{FixbaseError, Rejection, Result};
pub use fixes::{FixRecord, FixStore, NewFix, RankedFix, RemoteRef};
pub use guard::AbuseGuard;
pub use identity::{ConsensusIdIssuer, LinkOutcome};
pub use publish::{ArtifactCrypto, PublishOutcome, Publisher};
pub use state::StateStore;
pub use vcs::{GitCli, VersionControlBackend};
