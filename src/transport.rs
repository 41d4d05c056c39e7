/// Service transport seam.
///
/// The orchestrator, builder submission path and migration all talk to the
/// group service through this trait; production code plugs in an HTTP client,
/// tests plug in a scripted implementation.
use async_trait::async_trait;
use thiserror::Error;

use crate::actions::ChangeActionSet;
use crate::ids::GroupId;
use crate::wire::{ChangePage, EncryptedGroupSnapshot, GroupJoinInfo};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// Submission raced with another writer; re-fetch and rebuild.
    #[error("revision conflict")]
    Conflict,

    /// The service refused the credential, or the local user is not in the
    /// group at all.
    #[error("unauthorized")]
    Unauthorized,

    #[error("group not found")]
    NotFound,

    /// Change log no longer available from the requested revision; the only
    /// recovery is a snapshot fetch.
    #[error("change log unavailable")]
    NoChangeLog,

    /// Service-side limit (member count, blob size) rejected the request.
    #[error("resource limit exceeded")]
    ResourceLimit,

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Fetch change-log entries starting at `from_revision` (inclusive).
    /// `include_first_state` asks the service to attach a snapshot to the
    /// first entry, used when the local model is a placeholder.
    async fn fetch_change_log(
        &self,
        group: &GroupId,
        from_revision: u32,
        include_first_state: bool,
    ) -> Result<ChangePage, TransportError>;

    /// Fetch the current authoritative snapshot.
    async fn fetch_snapshot(&self, group: &GroupId)
        -> Result<EncryptedGroupSnapshot, TransportError>;

    /// Fetch the pre-join summary exposed through an invite link.
    async fn fetch_join_info(&self, group: &GroupId) -> Result<GroupJoinInfo, TransportError>;

    /// Submit a change set built against the local revision. On success the
    /// service returns the set it committed, with the revision it assigned.
    async fn submit_change(
        &self,
        group: &GroupId,
        set: ChangeActionSet,
    ) -> Result<ChangeActionSet, TransportError>;

    /// Create a brand-new group from a complete snapshot (migration path).
    async fn create_group(
        &self,
        group: &GroupId,
        snapshot: EncryptedGroupSnapshot,
    ) -> Result<(), TransportError>;
}
