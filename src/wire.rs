/// Encrypted wire representations exchanged with the service, and the
/// pagination signalling used by change-log fetches.
///
/// These are what the transport hands us before any decryption: member
/// identifiers and attribute values are ciphertexts. The applicator and
/// snapshot decryptor turn them into `GroupState`.
use serde::{Deserialize, Serialize};

use crate::actions::ChangeActionSet;
use crate::ids::{OpaqueUserId, ProfileKeyCiphertext};
use crate::state::{AccessControls, AccessLevel, AvatarRef, Role};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedMember {
    pub user_id: OpaqueUserId,
    pub role: Role,
    pub profile_key: ProfileKeyCiphertext,
    pub joined_at_revision: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedPendingMember {
    pub user_id: OpaqueUserId,
    pub role: Role,
    pub added_by: OpaqueUserId,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedRequestingMember {
    pub user_id: OpaqueUserId,
    pub profile_key: ProfileKeyCiphertext,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedBannedMember {
    pub user_id: OpaqueUserId,
    pub banned_at_ms: u64,
}

/// Full authoritative group state at one revision, as stored by the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedGroupSnapshot {
    pub revision: u32,
    /// Encrypted `AttributeBlob::Title`; `None` when never set.
    pub title_blob: Option<Vec<u8>>,
    pub description_blob: Option<Vec<u8>>,
    /// Avatar content materialized by the transport adapter.
    pub avatar: Option<AvatarRef>,
    /// Encrypted `AttributeBlob::Timer`; `None` means disabled.
    pub timer_blob: Option<Vec<u8>>,
    pub access: AccessControls,
    pub invite_link_password: Option<Vec<u8>>,
    pub announcements_only: bool,
    pub members: Vec<EncryptedMember>,
    pub pending_members: Vec<EncryptedPendingMember>,
    pub requesting_members: Vec<EncryptedRequestingMember>,
    pub banned_members: Vec<EncryptedBannedMember>,
}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

/// One entry of the paged change log. The service may attach a full snapshot
/// to an entry (always does for the entry that admitted the local user).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeLogEntry {
    pub change: Option<ChangeActionSet>,
    pub snapshot: Option<EncryptedGroupSnapshot>,
}

/// A page of change-log entries in strictly increasing revision order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ChangePage {
    pub entries: Vec<ChangeLogEntry>,
    /// When the service truncated the response: the last revision actually
    /// returned (parsed from the `versions` range header). `None` means the
    /// page is complete.
    pub partial: Option<u32>,
}

impl ChangePage {
    /// Revision of the last change in this page, if any.
    pub fn last_revision(&self) -> Option<u32> {
        self.entries
            .iter()
            .rev()
            .find_map(|e| e.change.as_ref().map(|c| c.revision))
    }
}

/// Summary returned for invite-link joins before the requester can read the
/// full group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupJoinInfo {
    pub revision: u32,
    pub member_count: u32,
    pub add_from_invite_link: AccessLevel,
    pub pending_admin_approval: bool,
}

// ---------------------------------------------------------------------------
// Range header
// ---------------------------------------------------------------------------

/// Parse a partial-page range header of the literal form
/// `versions <start>-<end>/<total>`.
///
/// Returns `(start, end, total)`. Anything malformed yields `None`; the
/// caller treats that as "no partial info", never as a hard error.
pub fn parse_version_range(header: &str) -> Option<(u32, u32, u32)> {
    let rest = header.strip_prefix("versions ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end, total))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
