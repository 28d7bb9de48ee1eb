//! Public index file
//!
//! Append-mostly JSON list of `RemoteRef`s at the root of the shared
//! repository. Entries are only removed by the daemon's maintenance
//! passes, and every such removal is followed by a commit.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::fixes::RemoteRef;

pub const INDEX_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub refs: Vec<RemoteRef>,
}

impl Default for PublicIndex {
    fn default() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            refs: Vec::new(),
        }
    }
}

impl PublicIndex {
    /// Decode index bytes; unreadable content yields an empty index
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<PublicIndex>(bytes) {
            Ok(index) if index.schema_version == INDEX_SCHEMA_VERSION => index,
            Ok(index) => {
                warn!(version = index.schema_version, "Unsupported index schema, treating as empty");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "Unreadable public index, treating as empty");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(Self::parse(&std::fs::read(path)?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write through a temp file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_bytes()?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), refs = self.refs.len(), "Public index written");
        Ok(())
    }

    pub fn contains_hash(&self, fix_hash: &str) -> bool {
        self.refs.iter().any(|r| r.fix_hash == fix_hash)
    }

    /// Append unless the same publication is already listed
    pub fn append(&mut self, entry: RemoteRef) -> bool {
        if self.refs.iter().any(|r| r.same_entry(&entry)) {
            return false;
        }
        self.refs.push(entry);
        true
    }
}

/// Resolve a conflicted index: remote side is the base, local
/// publications missing from it are replayed on top.
pub fn merge_index(remote: Option<&[u8]>, local: Option<&[u8]>) -> PublicIndex {
    let mut merged = remote.map(PublicIndex::parse).unwrap_or_default();
    if let Some(local) = local.map(PublicIndex::parse) {
        let mut replayed = 0;
        for entry in local.refs {
            if merged.append(entry) {
                replayed += 1;
            }
        }
        debug!(replayed, total = merged.refs.len(), "Index conflict merged");
    }
    merged
}
