//! # Aegis Groups
//!
//! **Client-side replica engine for end-to-end encrypted, service-replicated
//! groups.**
//!
//! The service stores each group as an encrypted snapshot plus an ordered,
//! revision-numbered change log; it can order changes and enforce limits but
//! can read none of the content. This crate maintains the local decrypted
//! replica: it applies committed change sets deterministically, builds minimal
//! outgoing change sets from user intents, keeps the replica fresh against the
//! service, and migrates legacy (non-replicated) groups.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`state`] | The decrypted replica: membership categories, access controls, attributes |
//! | [`actions`] | Change-action vocabulary and canonical set ordering |
//! | [`apply`] | Deterministic fold of a change set into the next revision |
//! | [`builder`] | User intent to minimal, conflict-resolved change set |
//! | [`sync`] | Refresh lanes, pagination, snapshot fallback, submission |
//! | [`migration`] | One-shot legacy group transform |
//! | [`cipher`] | Zero-knowledge cipher seam (plus an LRU caching wrapper) |
//! | [`wire`] | Encrypted representations exchanged with the service |
//! | [`transport`] / [`store`] | Service and persistence seams callers implement |
//!
//! All cryptography lives behind [`cipher::GroupCipher`]; this crate never
//! sees key material beyond the profile keys it forwards to the contact
//! layer.

pub mod actions;
pub mod apply;
pub mod builder;
pub mod cache;
pub mod cipher;
pub mod ids;
pub mod limits;
pub mod migration;
pub mod state;
pub mod store;
pub mod sync;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_utils;

pub use actions::{AttributeBlob, ChangeAction, ChangeActionSet};
pub use apply::{ApplyError, ApplyOutcome, AuthorityViolation, ChangeApplicator, DecryptedSnapshot};
pub use builder::{BuildError, ChangeIntent, LocalIdentity, OutgoingChangeBuilder, PendingChange};
pub use cipher::{CachingCipher, CipherError, GroupCipher};
pub use ids::{
    GroupId, LegacyGroupId, MemberId, OpaqueUserId, ProfileKey, ProfileKeyCiphertext,
    ProfileKeyCredential,
};
pub use migration::{
    CredentialResolver, LegacyDirectory, LegacyGroup, LegacyMember, MigrationEligibility,
    MigrationError, MigrationMode, MigrationOutcome, MigrationStateMachine, NoResolver,
};
pub use state::{AccessControls, AccessLevel, GroupMembership, GroupState, Role};
pub use store::{CredentialSource, GroupStore, ProfileKeyStore, StoreError};
pub use sync::{
    MessageBacklog, NoBacklog, RefreshMode, RefreshOutcome, SubmitOutcome, SyncError,
    SyncOrchestrator,
};
pub use transport::{GroupTransport, TransportError};
