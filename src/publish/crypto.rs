//! Artifact encryption and signing
//!
//! - **Encryption**: ChaCha20-Poly1305 with a random 12-byte nonce per artifact
//! - **Signing**: Ed25519 over the artifact's content hash
//!
//! Key material lives under `<data_dir>/keys/` and never enters an artifact.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::patch::FixPatch;
use crate::error::{FixbaseError, Result};
use crate::fixes::Timestamp;

// =============================================================================
// Constants
// =============================================================================

pub const ALGORITHM: &str = "chacha20poly1305";

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Symmetric key length (32 bytes)
pub const KEY_LEN: usize = 32;

const ARTIFACT_KEY_FILE: &str = "artifact.key";
const SIGNING_KEY_FILE: &str = "signing.key";

// =============================================================================
// Artifacts
// =============================================================================

/// Encrypted patch as stored in the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedArtifact {
    pub fix_hash: String,
    pub algorithm: String,
    /// Hex nonce
    pub nonce: String,
    /// Base64 ciphertext including the auth tag
    pub ciphertext: String,
}

impl EncryptedArtifact {
    /// SHA-256 over everything a reader relies on
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fix_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.algorithm.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.nonce.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.ciphertext.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Detached signature stored next to an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSignature {
    pub fix_hash: String,
    pub content_hash: String,
    pub signer_id: String,
    /// Hex Ed25519 verifying key
    pub public_key: String,
    /// Hex Ed25519 signature
    pub signature: String,
    pub signed_at: Timestamp,
}

impl ArtifactSignature {
    fn message(fix_hash: &str, content_hash: &str, signer_id: &str) -> Vec<u8> {
        format!("{}:{}:{}", fix_hash, content_hash, signer_id).into_bytes()
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Encryption and signing keys of the local identity
pub struct ArtifactCrypto {
    key: [u8; KEY_LEN],
    signing_key: SigningKey,
    signer_id: String,
}

impl ArtifactCrypto {
    /// Load keys from `keys_dir`, generating any that are missing
    pub fn load_or_create(keys_dir: &Path, signer_id: &str) -> Result<Self> {
        std::fs::create_dir_all(keys_dir)?;

        let key = read_or_generate(&keys_dir.join(ARTIFACT_KEY_FILE))?;
        let seed = read_or_generate(&keys_dir.join(SIGNING_KEY_FILE))?;

        debug!(dir = %keys_dir.display(), "Artifact keys loaded");
        Ok(Self::from_keys(key, SigningKey::from_bytes(&seed), signer_id))
    }

    pub fn from_keys(key: [u8; KEY_LEN], signing_key: SigningKey, signer_id: &str) -> Self {
        Self {
            key,
            signing_key,
            signer_id: signer_id.to_string(),
        }
    }

    /// Fresh keys held only in memory
    pub fn ephemeral(signer_id: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_keys(key, SigningKey::generate(&mut OsRng), signer_id)
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn encrypt(&self, patch: &FixPatch) -> Result<EncryptedArtifact> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), patch.to_bytes()?.as_slice())
            .map_err(|_| FixbaseError::Crypto("encryption failed".to_string()))?;

        Ok(EncryptedArtifact {
            fix_hash: patch.fix_hash.clone(),
            algorithm: ALGORITHM.to_string(),
            nonce: hex::encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, artifact: &EncryptedArtifact) -> Result<FixPatch> {
        if artifact.algorithm != ALGORITHM {
            return Err(FixbaseError::Crypto(format!(
                "unsupported algorithm {}",
                artifact.algorithm
            )));
        }
        let nonce = hex::decode(&artifact.nonce)
            .map_err(|e| FixbaseError::Crypto(format!("bad nonce: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(FixbaseError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&artifact.ciphertext)
            .map_err(|e| FixbaseError::Crypto(format!("bad ciphertext encoding: {}", e)))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| FixbaseError::Crypto("decryption failed (wrong key?)".to_string()))?;

        let patch = FixPatch::from_bytes(&plaintext)?;
        if patch.fix_hash != artifact.fix_hash {
            return Err(FixbaseError::Crypto("artifact hash does not match payload".to_string()));
        }
        Ok(patch)
    }

    pub fn sign(&self, artifact: &EncryptedArtifact) -> Result<ArtifactSignature> {
        let content_hash = artifact.content_hash();
        let message = ArtifactSignature::message(&artifact.fix_hash, &content_hash, &self.signer_id);
        let signature: Signature = self.signing_key.sign(&message);

        Ok(ArtifactSignature {
            fix_hash: artifact.fix_hash.clone(),
            content_hash,
            signer_id: self.signer_id.clone(),
            public_key: hex::encode(self.verifying_key().to_bytes()),
            signature: hex::encode(signature.to_bytes()),
            signed_at: Utc::now(),
        })
    }
}

/// Check a detached signature against the artifact it claims to cover.
///
/// Self-contained: the verifying key travels with the signature.
pub fn verify_signature(artifact: &EncryptedArtifact, signature: &ArtifactSignature) -> Result<()> {
    if signature.fix_hash != artifact.fix_hash {
        return Err(FixbaseError::Crypto("signature is for a different fix".to_string()));
    }
    if signature.content_hash != artifact.content_hash() {
        return Err(FixbaseError::Crypto("artifact content hash mismatch".to_string()));
    }

    let key_bytes: [u8; 32] = hex::decode(&signature.public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FixbaseError::Crypto("malformed public key".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| FixbaseError::Crypto(format!("invalid public key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(&signature.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FixbaseError::Crypto("malformed signature".to_string()))?;
    let sig = Signature::from_bytes(&sig_bytes);

    let message = ArtifactSignature::message(
        &signature.fix_hash,
        &signature.content_hash,
        &signature.signer_id,
    );
    verifying_key
        .verify(&message, &sig)
        .map_err(|_| FixbaseError::Crypto("signature verification failed".to_string()))
}

fn read_or_generate(path: &Path) -> Result<[u8; KEY_LEN]> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return bytes.try_into().map_err(|b: Vec<u8>| {
            FixbaseError::Crypto(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                b.len(),
                KEY_LEN
            ))
        });
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    std::fs::write(path, key)?;
    restrict_permissions(path)?;
    info!(path = %path.display(), "Generated key");
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::FixContext;
    use crate::publish::patch::create_patch;
    use tempfile::TempDir;

    fn patch() -> FixPatch {
        create_patch(
            None,
            "NameError",
            "NameError: name 'os' is not defined",
            "import os",
            &FixContext::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = ArtifactCrypto::ephemeral("cid-a");
        let patch = patch();
        let artifact = crypto.encrypt(&patch).unwrap();
        assert!(!artifact.ciphertext.contains("import os"));
        assert_eq!(crypto.decrypt(&artifact).unwrap(), patch);

        let other = ArtifactCrypto::ephemeral("cid-b");
        assert!(matches!(other.decrypt(&artifact), Err(FixbaseError::Crypto(_))));
    }

    #[test]
    fn test_nonce_is_fresh_per_artifact() {
        let crypto = ArtifactCrypto::ephemeral("cid-a");
        let patch = patch();
        let a = crypto.encrypt(&patch).unwrap();
        let b = crypto.encrypt(&patch).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_sign_and_verify() {
        let crypto = ArtifactCrypto::ephemeral("cid-a");
        let artifact = crypto.encrypt(&patch()).unwrap();
        let signature = crypto.sign(&artifact).unwrap();
        assert_eq!(signature.signer_id, "cid-a");
        verify_signature(&artifact, &signature).unwrap();

        let mut tampered = artifact.clone();
        tampered.ciphertext = STANDARD.encode(b"something else");
        assert!(verify_signature(&tampered, &signature).is_err());

        let mut forged = signature.clone();
        forged.signer_id = "cid-mallory".to_string();
        assert!(verify_signature(&artifact, &forged).is_err());
    }

    #[test]
    fn test_keys_persist() {
        let dir = TempDir::new().unwrap();
        let first = ArtifactCrypto::load_or_create(dir.path(), "cid-a").unwrap();
        let artifact = first.encrypt(&patch()).unwrap();

        let second = ArtifactCrypto::load_or_create(dir.path(), "cid-a").unwrap();
        assert_eq!(first.verifying_key(), second.verifying_key());
        assert!(second.decrypt(&artifact).is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(ARTIFACT_KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
