//! Shareable fix artifacts

use serde::{Deserialize, Serialize};

use crate::error::{FixbaseError, Result};
use crate::fixes::normalize::{fix_hash, normalize_solution, signature_key};
use crate::fixes::{FixContext, Timestamp};

pub const PATCH_FORMAT_VERSION: u32 = 1;

/// Plaintext payload of a published fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPatch {
    pub format_version: u32,
    pub fix_hash: String,
    /// Script or command the fix applies to, if any
    #[serde(default)]
    pub script_ref: Option<String>,
    pub error_type: String,
    /// Normalized signature; paths and line numbers are already stripped
    pub error_signature: String,
    pub solution: String,
    #[serde(default)]
    pub context: FixContext,
    pub created_at: Timestamp,
}

impl FixPatch {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Build the artifact for one fix.
///
/// The hash is derived from the normalized error and solution, so the
/// same content yields the same patch hash from any identity.
pub fn create_patch(
    script_ref: Option<&str>,
    error_type: &str,
    error: &str,
    solution: &str,
    context: &FixContext,
) -> Result<FixPatch> {
    let solution = normalize_solution(solution);
    if solution.is_empty() || error.trim().is_empty() {
        return Err(FixbaseError::InvalidInput(
            "cannot package an empty error or solution".to_string(),
        ));
    }

    Ok(FixPatch {
        format_version: PATCH_FORMAT_VERSION,
        fix_hash: fix_hash(error, &solution),
        script_ref: script_ref.map(str::to_string),
        error_type: error_type.to_string(),
        error_signature: signature_key(error),
        solution,
        context: context.clone(),
        created_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_hash_matches_store_hash() {
        let patch = create_patch(
            Some("deploy.sh"),
            "NameError",
            "NameError: name 'os' is not defined",
            "import os\n",
            &FixContext::new(),
        )
        .unwrap();
        assert_eq!(patch.fix_hash, fix_hash("NameError: name 'os' is not defined", "import os"));
        assert_eq!(patch.solution, "import os");
        assert_eq!(patch.script_ref.as_deref(), Some("deploy.sh"));
    }

    #[test]
    fn test_patch_strips_paths_from_signature() {
        let patch = create_patch(
            None,
            "FileNotFoundError",
            "FileNotFoundError: /home/alice/secret/config.yaml",
            "touch config.yaml",
            &FixContext::new(),
        )
        .unwrap();
        assert!(!patch.error_signature.contains("alice"));
    }

    #[test]
    fn test_empty_solution_rejected() {
        assert!(create_patch(None, "E", "boom", "  \n", &FixContext::new()).is_err());
    }
}
