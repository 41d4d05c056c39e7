/// Core identity types for the replicated group system.
///
/// - `GroupId`: 32-byte opaque key under which the service stores the group
/// - `MemberId`: service-level member identity (UUID)
/// - `OpaqueUserId`: ciphertext of an encrypted member identifier, as seen by
///   the zero-knowledge service
/// - `ProfileKey` / `ProfileKeyCiphertext` / `ProfileKeyCredential`: per-member
///   profile key material and its encrypted / presentable forms
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Opaque group identifier: the key under which the service stores the
/// encrypted group. The service never learns anything else about the group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// MemberId
// ---------------------------------------------------------------------------

/// Service-level member identity. Only ever sent to the service in encrypted
/// form (`OpaqueUserId`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new(uuid: Uuid) -> Self {
        MemberId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "MemberId({})", &s[..8])
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// OpaqueUserId
// ---------------------------------------------------------------------------

/// Ciphertext of an encrypted member identifier. This is what the service and
/// the wire format traffic in; it only becomes a `MemberId` after a successful
/// `GroupCipher::decrypt_identifier`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpaqueUserId(pub Vec<u8>);

impl OpaqueUserId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        OpaqueUserId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for OpaqueUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        let short = &hex[..hex.len().min(8)];
        write!(f, "OpaqueUserId({})", short)
    }
}

// ---------------------------------------------------------------------------
// LegacyGroupId
// ---------------------------------------------------------------------------

/// Identifier of a pre-replication group, as used by the legacy store. Only
/// the migration path and the store's atomic replace touch these.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LegacyGroupId(pub [u8; 16]);

impl LegacyGroupId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        LegacyGroupId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for LegacyGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LegacyGroupId({})", &hex::encode(self.0)[..8])
    }
}

// ---------------------------------------------------------------------------
// Profile key material
// ---------------------------------------------------------------------------

/// A member's 32-byte profile key. Zeroized on drop; never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ProfileKey(pub [u8; 32]);

impl ProfileKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ProfileKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileKey(..)")
    }
}

/// Encrypted profile key as carried on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileKeyCiphertext(pub Vec<u8>);

impl ProfileKeyCiphertext {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ProfileKeyCiphertext(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ProfileKeyCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileKeyCiphertext(..)")
    }
}

/// A profile key attested by the external credential system, which is what
/// entitles us to add its owner directly. Wire actions never carry it as-is;
/// the builder encrypts the inner key into a `ProfileKeyCiphertext` that any
/// replica can decrypt back.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileKeyCredential(pub ProfileKey);

impl ProfileKeyCredential {
    pub fn profile_key(&self) -> &ProfileKey {
        &self.0
    }
}

impl fmt::Debug for ProfileKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileKeyCredential(..)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_hex_roundtrip() {
        let gid = GroupId::from_bytes([0xAB; 32]);
        assert_eq!(gid.to_hex().len(), 64);
        assert!(gid.to_hex().starts_with("abab"));
    }

    #[test]
    fn test_group_id_debug_truncated() {
        let gid = GroupId::from_bytes([0xCD; 32]);
        assert_eq!(format!("{:?}", gid), "GroupId(cdcdcdcd)");
    }

    #[test]
    fn test_profile_key_debug_redacted() {
        let key = ProfileKey::from_bytes([7; 32]);
        assert_eq!(format!("{:?}", key), "ProfileKey(..)");
    }

    #[test]
    fn test_member_id_ordering_stable() {
        let a = MemberId::new(Uuid::from_u128(1));
        let b = MemberId::new(Uuid::from_u128(2));
        assert!(a < b);
    }

    #[test]
    fn test_opaque_user_id_debug_short_input() {
        // Shorter than the 8-hex-char window; must not panic.
        let id = OpaqueUserId::from_bytes(vec![0x01]);
        assert_eq!(format!("{:?}", id), "OpaqueUserId(01)");
    }
}
