/// Zero-knowledge cipher boundary.
///
/// All cryptography is performed by an external collaborator implementing
/// `GroupCipher`. Implementations must be pure and deterministic for a given
/// group secret: the applicator's determinism guarantee depends on it.
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::ids::{MemberId, OpaqueUserId, ProfileKey, ProfileKeyCiphertext};
use crate::limits::BLOB_CACHE_ENTRIES;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum CipherError {
    #[error("Blob decryption failed: {0}")]
    BlobDecrypt(String),

    #[error("Blob encryption failed: {0}")]
    BlobEncrypt(String),

    #[error("Identifier decryption failed")]
    IdentifierDecrypt,

    #[error("Identifier encryption failed")]
    IdentifierEncrypt,

    #[error("Profile key decryption failed")]
    ProfileKeyDecrypt,

    #[error("Profile key encryption failed")]
    ProfileKeyEncrypt,
}

// ---------------------------------------------------------------------------
// GroupCipher
// ---------------------------------------------------------------------------

/// Opaque encrypt/decrypt operations over one group's secret material.
/// Fallible, side-effect free, potentially expensive.
pub trait GroupCipher: Send + Sync {
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt_blob(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn encrypt_identifier(&self, member: &MemberId) -> Result<OpaqueUserId, CipherError>;

    fn decrypt_identifier(&self, user_id: &OpaqueUserId) -> Result<MemberId, CipherError>;

    fn encrypt_profile_key(
        &self,
        key: &ProfileKey,
        member: &MemberId,
    ) -> Result<ProfileKeyCiphertext, CipherError>;

    fn decrypt_profile_key(
        &self,
        ciphertext: &ProfileKeyCiphertext,
        member: &MemberId,
    ) -> Result<ProfileKey, CipherError>;
}

// ---------------------------------------------------------------------------
// CachingCipher
// ---------------------------------------------------------------------------

/// Bounded LRU cache over an inner cipher's decrypt results.
///
/// Identifier and blob decryption recur constantly during change-log replay
/// (the same members appear in action after action); caching is safe because
/// the inner cipher is deterministic for a fixed group secret. Failures are
/// not cached.
pub struct CachingCipher {
    inner: Arc<dyn GroupCipher>,
    blobs: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
    identifiers: Mutex<LruCache<Vec<u8>, MemberId>>,
}

impl CachingCipher {
    pub fn new(inner: Arc<dyn GroupCipher>) -> Self {
        let capacity = NonZeroUsize::new(BLOB_CACHE_ENTRIES).unwrap();
        CachingCipher {
            inner,
            blobs: Mutex::new(LruCache::new(capacity)),
            identifiers: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[cfg(test)]
    pub fn cached_blobs(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl GroupCipher for CachingCipher {
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.inner.encrypt_blob(plaintext)
    }

    fn decrypt_blob(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if let Some(hit) = self.blobs.lock().unwrap().get(ciphertext) {
            return Ok(hit.clone());
        }
        let plaintext = self.inner.decrypt_blob(ciphertext)?;
        self.blobs
            .lock()
            .unwrap()
            .put(ciphertext.to_vec(), plaintext.clone());
        Ok(plaintext)
    }

    fn encrypt_identifier(&self, member: &MemberId) -> Result<OpaqueUserId, CipherError> {
        self.inner.encrypt_identifier(member)
    }

    fn decrypt_identifier(&self, user_id: &OpaqueUserId) -> Result<MemberId, CipherError> {
        if let Some(hit) = self.identifiers.lock().unwrap().get(user_id.as_bytes()) {
            return Ok(*hit);
        }
        let member = self.inner.decrypt_identifier(user_id)?;
        self.identifiers
            .lock()
            .unwrap()
            .put(user_id.as_bytes().to_vec(), member);
        Ok(member)
    }

    fn encrypt_profile_key(
        &self,
        key: &ProfileKey,
        member: &MemberId,
    ) -> Result<ProfileKeyCiphertext, CipherError> {
        self.inner.encrypt_profile_key(key, member)
    }

    fn decrypt_profile_key(
        &self,
        ciphertext: &ProfileKeyCiphertext,
        member: &MemberId,
    ) -> Result<ProfileKey, CipherError> {
        self.inner.decrypt_profile_key(ciphertext, member)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
