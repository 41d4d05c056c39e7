/// One-shot transform of a legacy (non-replicated) group into a replicated
/// group.
///
/// Migration is irreversible and runs at most once per legacy group: the
/// outcome is a replicated group created at revision 0 plus an atomic store
/// swap that retires the legacy record. If another device won the migration
/// race, the service-side create conflicts and we adopt the existing
/// replicated group instead.
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::time::timeout;

use crate::apply::ChangeApplicator;
use crate::builder::LocalIdentity;
use crate::cipher::{CipherError, GroupCipher};
use crate::ids::{GroupId, LegacyGroupId, MemberId, ProfileKey, ProfileKeyCredential};
use crate::limits::{FETCH_TIMEOUT, MAX_GROUP_MEMBERS};
use crate::state::{
    AccessControls, AccessLevel, AvatarRef, DisappearingTimer, FullMember, GroupState,
    InvitedMember, Role,
};
use crate::store::{CredentialSource, GroupStore, StoreError};
use crate::transport::{GroupTransport, TransportError};
use crate::wire::{EncryptedGroupSnapshot, EncryptedMember, EncryptedPendingMember};
use crate::actions::{AttributeBlob, BlobError};

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Legacy inputs
// ---------------------------------------------------------------------------

/// A member of a legacy group, as well as the legacy store knows them.
/// Identities were optional in the legacy model, which is exactly why some
/// members cannot be carried over.
#[derive(Clone, Debug)]
pub struct LegacyMember {
    pub member: Option<MemberId>,
    pub profile_key: Option<ProfileKey>,
}

#[derive(Clone, Debug)]
pub struct LegacyGroup {
    pub id: LegacyGroupId,
    pub title: String,
    pub members: Vec<LegacyMember>,
    pub timer_secs: u32,
    pub avatar: Option<AvatarRef>,
}

/// Source of legacy group records.
#[async_trait]
pub trait LegacyDirectory: Send + Sync {
    async fn load_legacy(&self, id: &LegacyGroupId) -> Result<Option<LegacyGroup>, StoreError>;
}

/// Best-effort lookup of credentials the local store does not hold. The
/// migration consults it once, before classifying the group, so a member the
/// resolver can vouch for is carried over as a full member instead of an
/// invite. Resolution failures are not errors; the member simply stays
/// unresolved.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, members: &[MemberId]) -> BTreeMap<MemberId, ProfileKeyCredential>;
}

/// Resolver that never finds anything.
pub struct NoResolver;

#[async_trait]
impl CredentialResolver for NoResolver {
    async fn resolve(&self, _members: &[MemberId]) -> BTreeMap<MemberId, ProfileKeyCredential> {
        BTreeMap::new()
    }
}

/// Local credentials overlaid with whatever the resolver turned up for this
/// one migration.
struct ResolvedCredentials<'a> {
    base: &'a dyn CredentialSource,
    fetched: BTreeMap<MemberId, ProfileKeyCredential>,
}

impl CredentialSource for ResolvedCredentials<'_> {
    fn credential(&self, member: &MemberId) -> Option<ProfileKeyCredential> {
        self.fetched
            .get(member)
            .cloned()
            .or_else(|| self.base.credential(member))
    }
}

// ---------------------------------------------------------------------------
// Modes, outcomes, errors
// ---------------------------------------------------------------------------

/// Who asked for the migration, which sets how much loss it tolerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationMode {
    /// User-initiated; carries members without a credential as invites and
    /// drops members without an identity, as the user confirmed.
    Manual,
    /// Background-initiated; proceeds only when every member can be carried
    /// over in full.
    Automatic,
}

/// How a legacy group may be migrated right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationEligibility {
    /// Every member carries an identity; safe to migrate without user
    /// involvement.
    Automatic,
    /// Some members would be invited or dropped; requires explicit user
    /// confirmation.
    Manual {
        invited: Vec<MemberId>,
        dropped: usize,
    },
    /// Cannot be migrated at all.
    Ineligible(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MigrationOutcome {
    pub group: GroupId,
    pub state: GroupState,
    /// Members carried over as invites because no credential was on hand.
    pub invited: Vec<MemberId>,
    /// Members dropped entirely for lack of an identity.
    pub dropped: usize,
    /// True when another device migrated first and we adopted its group.
    pub adopted: bool,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("legacy group not found")]
    UnknownLegacyGroup,

    #[error("legacy group cannot be migrated: {0}")]
    Ineligible(String),

    /// Migrating would invite or drop members, which the automatic mode
    /// never does on its own.
    #[error("migration needs user confirmation: {invited} invited, {dropped} dropped")]
    RequiresManual { invited: usize, dropped: usize },

    /// A migration of the same legacy group is already running; this request
    /// is dropped, not queued.
    #[error("migration already in flight")]
    AlreadyRunning,

    /// The attempt hit its deadline. Nothing was committed locally; the
    /// caller may retry.
    #[error("migration timed out")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("adopted group is unreadable: {0}")]
    Unreadable(String),
}

// ---------------------------------------------------------------------------
// MigrationStateMachine
// ---------------------------------------------------------------------------

pub struct MigrationStateMachine {
    transport: Arc<dyn GroupTransport>,
    store: Arc<dyn GroupStore>,
    cipher: Arc<dyn GroupCipher>,
    resolver: Arc<dyn CredentialResolver>,
    identity: LocalIdentity,
    inflight: Mutex<HashSet<LegacyGroupId>>,
}

impl MigrationStateMachine {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        store: Arc<dyn GroupStore>,
        cipher: Arc<dyn GroupCipher>,
        resolver: Arc<dyn CredentialResolver>,
        identity: LocalIdentity,
    ) -> Self {
        MigrationStateMachine {
            transport,
            store,
            cipher,
            resolver,
            identity,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Classify a legacy group without performing anything.
    pub fn eligibility(
        &self,
        legacy: &LegacyGroup,
        credentials: &dyn CredentialSource,
    ) -> MigrationEligibility {
        if legacy.members.len() > MAX_GROUP_MEMBERS {
            return MigrationEligibility::Ineligible(format!(
                "{} members exceeds the replicated group limit",
                legacy.members.len()
            ));
        }

        let mut invited = Vec::new();
        let mut dropped = 0;
        for member in &legacy.members {
            match member.member {
                None => dropped += 1,
                Some(id) if id == self.identity.member => {}
                Some(id) => {
                    if credentials.credential(&id).is_none() {
                        invited.push(id);
                    }
                }
            }
        }

        if invited.is_empty() && dropped == 0 {
            MigrationEligibility::Automatic
        } else {
            MigrationEligibility::Manual { invited, dropped }
        }
    }

    /// Look the legacy group up in `directory` and migrate it.
    pub async fn migrate_by_id(
        &self,
        directory: &dyn LegacyDirectory,
        id: &LegacyGroupId,
        target: GroupId,
        mode: MigrationMode,
        credentials: &dyn CredentialSource,
        now_ms: u64,
    ) -> Result<MigrationOutcome, MigrationError> {
        let legacy = directory
            .load_legacy(id)
            .await?
            .ok_or(MigrationError::UnknownLegacyGroup)?;
        self.migrate(&legacy, target, mode, credentials, now_ms).await
    }

    /// Perform the migration: create the replicated group on the service and
    /// atomically swap the local records. One migration per legacy group at a
    /// time; a concurrent request fails fast instead of queueing.
    pub async fn migrate(
        &self,
        legacy: &LegacyGroup,
        target: GroupId,
        mode: MigrationMode,
        credentials: &dyn CredentialSource,
        now_ms: u64,
    ) -> Result<MigrationOutcome, MigrationError> {
        if !self.inflight.lock().unwrap().insert(legacy.id.clone()) {
            return Err(MigrationError::AlreadyRunning);
        }
        let result = self
            .migrate_inner(legacy, target, mode, credentials, now_ms)
            .await;
        self.inflight.lock().unwrap().remove(&legacy.id);
        result
    }

    async fn migrate_inner(
        &self,
        legacy: &LegacyGroup,
        target: GroupId,
        mode: MigrationMode,
        credentials: &dyn CredentialSource,
        now_ms: u64,
    ) -> Result<MigrationOutcome, MigrationError> {
        // Credentials we do not hold locally may still be resolvable; ask
        // once up front so resolved members ride over as full members.
        let me = self.identity.member;
        let unresolved: Vec<MemberId> = legacy
            .members
            .iter()
            .filter_map(|m| m.member)
            .filter(|id| *id != me && credentials.credential(id).is_none())
            .collect();
        let fetched = if unresolved.is_empty() {
            BTreeMap::new()
        } else {
            match timeout(FETCH_TIMEOUT, self.resolver.resolve(&unresolved)).await {
                Ok(fetched) => fetched,
                Err(_) => {
                    warn!("credential resolution timed out, continuing without");
                    BTreeMap::new()
                }
            }
        };
        let credentials = &ResolvedCredentials {
            base: credentials,
            fetched,
        };

        match self.eligibility(legacy, credentials) {
            MigrationEligibility::Ineligible(reason) => {
                return Err(MigrationError::Ineligible(reason))
            }
            MigrationEligibility::Manual { invited, dropped }
                if mode == MigrationMode::Automatic =>
            {
                return Err(MigrationError::RequiresManual {
                    invited: invited.len(),
                    dropped,
                })
            }
            _ => {}
        }

        let (state, snapshot, invited, dropped) =
            self.initial_state(legacy, credentials, now_ms)?;

        let created = timeout(FETCH_TIMEOUT, self.transport.create_group(&target, snapshot))
            .await
            .map_err(|_| MigrationError::Timeout)?;
        let adopted = match created {
            Ok(()) => false,
            // Lost the migration race to another device; its group is
            // authoritative.
            Err(TransportError::Conflict) => {
                info!("replicated group {} already exists, adopting", target);
                true
            }
            Err(err) => return Err(err.into()),
        };

        let state = if adopted {
            let snapshot = timeout(FETCH_TIMEOUT, self.transport.fetch_snapshot(&target))
                .await
                .map_err(|_| MigrationError::Timeout)??;
            let applicator = ChangeApplicator::new(self.cipher.as_ref(), self.identity.member);
            applicator
                .state_from_snapshot(&snapshot)
                .map_err(|e| MigrationError::Unreadable(e.to_string()))?
                .state
        } else {
            state
        };

        self.store.replace_legacy(&legacy.id, &target, &state).await?;
        info!(
            "migrated legacy group {:?} to {} ({} members, {} invited, {} dropped)",
            legacy.id,
            target,
            state.membership.full_members().len(),
            invited.len(),
            dropped
        );

        Ok(MigrationOutcome {
            group: target,
            state,
            invited,
            dropped,
            adopted,
        })
    }

    /// Build the revision-0 state and its encrypted snapshot. Every carried
    /// member becomes an administrator: the legacy model had no roles, so
    /// demoting anyone here would be inventing an authority decision no one
    /// made.
    fn initial_state(
        &self,
        legacy: &LegacyGroup,
        credentials: &dyn CredentialSource,
        now_ms: u64,
    ) -> Result<(GroupState, EncryptedGroupSnapshot, Vec<MemberId>, usize), MigrationError> {
        let me = self.identity.member;
        let mut state = GroupState::empty();
        state.title = if legacy.title.is_empty() {
            None
        } else {
            Some(legacy.title.clone())
        };
        state.timer = DisappearingTimer::from_duration(legacy.timer_secs);
        state.avatar = legacy.avatar.clone();
        state.access = AccessControls {
            members: AccessLevel::Member,
            attributes: AccessLevel::Member,
            add_from_invite_link: AccessLevel::Unsatisfiable,
        };

        let mut members = Vec::new();
        let mut pending = Vec::new();
        let mut invited = Vec::new();
        let mut dropped = 0;

        state.membership.add_full_member(
            me,
            FullMember {
                role: Role::Administrator,
                joined_at_revision: 0,
            },
        );
        members.push(EncryptedMember {
            user_id: self.cipher.encrypt_identifier(&me)?,
            role: Role::Administrator,
            profile_key: self
                .cipher
                .encrypt_profile_key(&self.identity.profile_key, &me)?,
            joined_at_revision: 0,
        });

        for member in &legacy.members {
            let id = match member.member {
                Some(id) if id != me => id,
                Some(_) => continue,
                None => {
                    dropped += 1;
                    continue;
                }
            };

            match credentials.credential(&id) {
                Some(credential) => {
                    state.membership.add_full_member(
                        id,
                        FullMember {
                            role: Role::Administrator,
                            joined_at_revision: 0,
                        },
                    );
                    members.push(EncryptedMember {
                        user_id: self.cipher.encrypt_identifier(&id)?,
                        role: Role::Administrator,
                        profile_key: self
                            .cipher
                            .encrypt_profile_key(credential.profile_key(), &id)?,
                        joined_at_revision: 0,
                    });
                }
                None => {
                    warn!("no credential for {}, carrying over as invite", id);
                    state.membership.add_invited_member(
                        id,
                        InvitedMember {
                            role: Role::Administrator,
                            added_by: me,
                            timestamp_ms: now_ms,
                        },
                    );
                    pending.push(EncryptedPendingMember {
                        user_id: self.cipher.encrypt_identifier(&id)?,
                        role: Role::Administrator,
                        added_by: self.cipher.encrypt_identifier(&me)?,
                        timestamp_ms: now_ms,
                    });
                    invited.push(id);
                }
            }
        }

        let title_blob = match &state.title {
            Some(title) => Some(
                self.cipher
                    .encrypt_blob(&AttributeBlob::Title(title.clone()).encode()?)?,
            ),
            None => None,
        };
        let timer_blob = if state.timer.enabled {
            Some(
                self.cipher
                    .encrypt_blob(&AttributeBlob::Timer(state.timer.duration_secs).encode()?)?,
            )
        } else {
            None
        };

        let snapshot = EncryptedGroupSnapshot {
            revision: 0,
            title_blob,
            description_blob: None,
            avatar: legacy.avatar.clone(),
            timer_blob,
            access: state.access,
            invite_link_password: None,
            announcements_only: false,
            members,
            pending_members: pending,
            requesting_members: Vec::new(),
            banned_members: Vec::new(),
        };

        Ok((state, snapshot, invited, dropped))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
