//! Fix dictionary
//!
//! - `model` - fix records, remote refs and their persisted documents
//! - `normalize` - signature keys, grouping keys, content hashes
//! - `scoring` - stored relevance and query-time search score
//! - `store` - the local store and its operations

pub mod model;
pub mod normalize;
pub mod scoring;
pub mod store;

pub use model::{
    FixContext, FixDictionary, FixRecord, FixSource, Lineage, MergedFix, QuarantineMark,
    RankedFix, RemoteCache, RemoteRef, Timestamp, UsageStats,
};
pub use store::{CacheSyncSummary, FixStore, NewFix};
