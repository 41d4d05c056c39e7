/// Persistence seams.
///
/// The crate never owns a database; callers provide implementations over
/// whatever storage the application uses. `MemoryStore` in the test support
/// module implements all three.
use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{GroupId, LegacyGroupId, MemberId, ProfileKey, ProfileKeyCredential};
use crate::state::GroupState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage i/o failure: {0}")]
    Io(String),

    #[error("corrupt stored state: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Group state store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn load(&self, group: &GroupId) -> Result<Option<GroupState>, StoreError>;

    /// Persist `state` as the new local model. `author` is the identity that
    /// produced the change when known, so the application can attribute
    /// update notifications.
    async fn save(
        &self,
        group: &GroupId,
        state: &GroupState,
        author: Option<MemberId>,
    ) -> Result<(), StoreError>;

    /// Atomically remove the legacy record and install the replicated group
    /// in its place. Both sides must land or neither.
    async fn replace_legacy(
        &self,
        legacy: &LegacyGroupId,
        group: &GroupId,
        state: &GroupState,
    ) -> Result<(), StoreError>;

    /// Record that a successful refresh for `group` completed at `revision`.
    /// Survives restarts so throttling does not reset on relaunch.
    async fn mark_refreshed(&self, group: &GroupId, revision: u32) -> Result<(), StoreError>;

    async fn refreshed_revision(&self, group: &GroupId) -> Result<Option<u32>, StoreError>;
}

// ---------------------------------------------------------------------------
// Profile key sidecar store
// ---------------------------------------------------------------------------

/// Receives profile keys learned while applying changes. Keys flow one way,
/// out of the group model and into the contact layer.
#[async_trait]
pub trait ProfileKeyStore: Send + Sync {
    async fn merge_profile_keys(
        &self,
        keys: &BTreeMap<MemberId, ProfileKey>,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Credential lookup
// ---------------------------------------------------------------------------

/// Synchronous lookup of member credentials the builder needs to emit a
/// direct add. A missing credential downgrades the add to an invite.
pub trait CredentialSource: Send + Sync {
    fn credential(&self, member: &MemberId) -> Option<ProfileKeyCredential>;
}
