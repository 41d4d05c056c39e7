/// Change-action sets: the atomic, revision-numbered unit of group edits.
///
/// A `ChangeActionSet` is authored by one identity and either produced by the
/// service (authoritative, fetched from the change log) or synthesized locally
/// by the outgoing-change builder (proposed; authoritative only once the
/// service echoes it back). Member identifiers and attribute values travel
/// encrypted: the applicator decrypts them via the injected cipher.
///
/// Wire ordering is significant and fixed: full members, pending members,
/// requesting members, bans, attributes (title, description, avatar, timer,
/// access controls, invite link, announcements-only), then profile keys.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{OpaqueUserId, ProfileKeyCiphertext};
use crate::state::{AccessLevel, AvatarRef, Role};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("CBOR encoding failed: {0}")]
    Encode(String),

    #[error("CBOR decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Attribute blobs
// ---------------------------------------------------------------------------

/// Plaintext of an encrypted group attribute. Encoded as CBOR before
/// encryption so the service only ever sees an opaque blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum AttributeBlob {
    /// Empty string clears the title.
    Title(String),
    /// Empty string clears the description.
    Description(String),
    /// Timer duration in seconds; zero disables.
    Timer(u32),
    Avatar(Vec<u8>),
}

impl AttributeBlob {
    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| BlobError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        ciborium::from_reader(bytes).map_err(|e| BlobError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ChangeAction
// ---------------------------------------------------------------------------

/// A single edit within a change-action set. Identifier and profile-key
/// fields are ciphertexts; `blob` fields are encrypted `AttributeBlob`s.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ChangeAction {
    // -- full members -------------------------------------------------------
    AddMember {
        user_id: OpaqueUserId,
        role: Role,
        profile_key: ProfileKeyCiphertext,
        joined_via_invite_link: bool,
    },
    DeleteMember {
        user_id: OpaqueUserId,
    },
    ModifyMemberRole {
        user_id: OpaqueUserId,
        role: Role,
    },

    // -- pending (invited) members ------------------------------------------
    AddPendingMember {
        user_id: OpaqueUserId,
        role: Role,
        added_by: OpaqueUserId,
        timestamp_ms: u64,
    },
    DeletePendingMember {
        user_id: OpaqueUserId,
    },
    PromotePendingMember {
        user_id: OpaqueUserId,
        profile_key: ProfileKeyCiphertext,
    },

    // -- requesting members -------------------------------------------------
    AddRequestingMember {
        user_id: OpaqueUserId,
        profile_key: ProfileKeyCiphertext,
        timestamp_ms: u64,
    },
    DeleteRequestingMember {
        user_id: OpaqueUserId,
    },
    PromoteRequestingMember {
        user_id: OpaqueUserId,
        role: Role,
    },

    // -- bans ---------------------------------------------------------------
    AddBannedMember {
        user_id: OpaqueUserId,
        banned_at_ms: u64,
    },
    DeleteBannedMember {
        user_id: OpaqueUserId,
    },

    // -- attributes ---------------------------------------------------------
    ModifyTitle {
        blob: Vec<u8>,
    },
    ModifyDescription {
        blob: Vec<u8>,
    },
    /// Avatar content is materialized by the transport adapter before the
    /// action reaches the applicator; `None` clears the avatar.
    ModifyAvatar {
        avatar: Option<AvatarRef>,
    },
    ModifyTimer {
        blob: Vec<u8>,
    },
    ModifyMembersAccess {
        access: AccessLevel,
    },
    ModifyAttributesAccess {
        access: AccessLevel,
    },
    ModifyInviteLinkAccess {
        access: AccessLevel,
    },
    ModifyInviteLinkPassword {
        password: Option<Vec<u8>>,
    },
    ModifyAnnouncementsOnly {
        announcements_only: bool,
    },

    // -- profile keys (always evaluated last) -------------------------------
    ModifyMemberProfileKey {
        user_id: OpaqueUserId,
        profile_key: ProfileKeyCiphertext,
    },
}

impl ChangeAction {
    /// Canonical wire position of this action's category. Builders emit
    /// actions sorted by rank; in-category order is emission order.
    pub fn rank(&self) -> u8 {
        use ChangeAction::*;
        match self {
            AddMember { .. } | DeleteMember { .. } | ModifyMemberRole { .. } => 0,
            AddPendingMember { .. } | DeletePendingMember { .. } | PromotePendingMember { .. } => 1,
            AddRequestingMember { .. }
            | DeleteRequestingMember { .. }
            | PromoteRequestingMember { .. } => 2,
            AddBannedMember { .. } | DeleteBannedMember { .. } => 3,
            ModifyTitle { .. } => 4,
            ModifyDescription { .. } => 5,
            ModifyAvatar { .. } => 6,
            ModifyTimer { .. } => 7,
            ModifyMembersAccess { .. } | ModifyAttributesAccess { .. } => 8,
            ModifyInviteLinkAccess { .. } | ModifyInviteLinkPassword { .. } => 9,
            ModifyAnnouncementsOnly { .. } => 10,
            ModifyMemberProfileKey { .. } => 11,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        use ChangeAction::*;
        match self {
            AddMember { .. } => "AddMember",
            DeleteMember { .. } => "DeleteMember",
            ModifyMemberRole { .. } => "ModifyMemberRole",
            AddPendingMember { .. } => "AddPendingMember",
            DeletePendingMember { .. } => "DeletePendingMember",
            PromotePendingMember { .. } => "PromotePendingMember",
            AddRequestingMember { .. } => "AddRequestingMember",
            DeleteRequestingMember { .. } => "DeleteRequestingMember",
            PromoteRequestingMember { .. } => "PromoteRequestingMember",
            AddBannedMember { .. } => "AddBannedMember",
            DeleteBannedMember { .. } => "DeleteBannedMember",
            ModifyTitle { .. } => "ModifyTitle",
            ModifyDescription { .. } => "ModifyDescription",
            ModifyAvatar { .. } => "ModifyAvatar",
            ModifyTimer { .. } => "ModifyTimer",
            ModifyMembersAccess { .. } => "ModifyMembersAccess",
            ModifyAttributesAccess { .. } => "ModifyAttributesAccess",
            ModifyInviteLinkAccess { .. } => "ModifyInviteLinkAccess",
            ModifyInviteLinkPassword { .. } => "ModifyInviteLinkPassword",
            ModifyAnnouncementsOnly { .. } => "ModifyAnnouncementsOnly",
            ModifyMemberProfileKey { .. } => "ModifyMemberProfileKey",
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeActionSet
// ---------------------------------------------------------------------------

/// An atomic, revision-numbered bundle of edits authored by one identity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeActionSet {
    pub revision: u32,
    /// Encrypted identifier of the author.
    pub author: OpaqueUserId,
    pub actions: Vec<ChangeAction>,
}

impl ChangeActionSet {
    pub fn new(revision: u32, author: OpaqueUserId, actions: Vec<ChangeAction>) -> Self {
        ChangeActionSet {
            revision,
            author,
            actions,
        }
    }

    /// Whether the actions follow canonical wire ordering.
    pub fn is_canonical_order(&self) -> bool {
        self.actions.windows(2).all(|w| w[0].rank() <= w[1].rank())
    }

    /// Sort actions into canonical wire order (stable within a category).
    pub fn canonicalize(&mut self) {
        self.actions.sort_by_key(|a| a.rank());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
