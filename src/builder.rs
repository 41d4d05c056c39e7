/// Translation of local edit intents into minimal change-action sets.
///
/// The builder re-evaluates the intent against the state it is given, so a
/// rebuild after a submission conflict automatically drops edits the race
/// already performed. An intent whose every edit has been dropped is
/// `Redundant`, not an empty set.
use log::debug;
use thiserror::Error;

use crate::actions::{AttributeBlob, BlobError, ChangeAction, ChangeActionSet};
use crate::cipher::{CipherError, GroupCipher};
use crate::ids::{MemberId, OpaqueUserId, ProfileKey, ProfileKeyCiphertext};
use crate::state::{AccessLevel, AvatarRef, GroupState, Role};
use crate::store::CredentialSource;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum BuildError {
    /// Every edit in the intent is already reflected in the state.
    #[error("intent is already satisfied by the current state")]
    Redundant,

    /// The intent contradicts the state in a way that cannot be resolved by
    /// dropping edits (role change for a non-member, accepting an invite
    /// that no longer exists).
    #[error("intent conflicts with the current state: {0}")]
    Conflicting(String),

    #[error("cannot build a change against a placeholder state")]
    PlaceholderState,

    /// The local user's own profile key credential is not on hand. The
    /// caller fetches a fresh one and retries.
    #[error("no profile key credential for the local user")]
    MissingCredential,

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

// ---------------------------------------------------------------------------
// Identity & intent
// ---------------------------------------------------------------------------

/// The local user, as the builder needs it: who signs as author and which
/// profile key a self-referencing action carries.
#[derive(Clone)]
pub struct LocalIdentity {
    pub member: MemberId,
    pub profile_key: ProfileKey,
}

/// What the user wants changed, expressed over decrypted identities. Field
/// setters consume and return the intent so call sites chain them.
#[derive(Clone, Debug, Default)]
pub struct ChangeIntent {
    title: Option<String>,
    description: Option<String>,
    avatar: Option<Option<AvatarRef>>,
    timer_secs: Option<u32>,
    add: Vec<MemberId>,
    remove: Vec<MemberId>,
    roles: Vec<(MemberId, Role)>,
    approve: Vec<MemberId>,
    deny: Vec<MemberId>,
    revoke_invites: Vec<MemberId>,
    revoke_invalid_invites: Vec<OpaqueUserId>,
    ban: Vec<MemberId>,
    unban: Vec<MemberId>,
    members_access: Option<AccessLevel>,
    attributes_access: Option<AccessLevel>,
    invite_link_access: Option<AccessLevel>,
    invite_link_password: Option<Option<Vec<u8>>>,
    announcements_only: Option<bool>,
    leave: bool,
    accept_invite: bool,
    refresh_profile_key: bool,
}

impl ChangeIntent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty string clears the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_avatar(mut self, avatar: Option<AvatarRef>) -> Self {
        self.avatar = Some(avatar);
        self
    }

    /// Zero disables the timer.
    pub fn with_timer(mut self, duration_secs: u32) -> Self {
        self.timer_secs = Some(duration_secs);
        self
    }

    /// Add members directly where a credential is on hand; others are
    /// downgraded to invites at build time.
    pub fn with_added_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.add.extend(members);
        self
    }

    pub fn with_removed_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.remove.extend(members);
        self
    }

    pub fn with_role(mut self, member: MemberId, role: Role) -> Self {
        self.roles.push((member, role));
        self
    }

    pub fn with_approved_requests(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.approve.extend(members);
        self
    }

    pub fn with_denied_requests(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.deny.extend(members);
        self
    }

    pub fn with_revoked_invites(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.revoke_invites.extend(members);
        self
    }

    /// Revoke invites that never decrypted; addressed by ciphertext.
    pub fn with_revoked_invalid_invites(
        mut self,
        invites: impl IntoIterator<Item = OpaqueUserId>,
    ) -> Self {
        self.revoke_invalid_invites.extend(invites);
        self
    }

    pub fn with_banned_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.ban.extend(members);
        self
    }

    pub fn with_unbanned_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.unban.extend(members);
        self
    }

    pub fn with_members_access(mut self, access: AccessLevel) -> Self {
        self.members_access = Some(access);
        self
    }

    pub fn with_attributes_access(mut self, access: AccessLevel) -> Self {
        self.attributes_access = Some(access);
        self
    }

    pub fn with_invite_link_access(mut self, access: AccessLevel) -> Self {
        self.invite_link_access = Some(access);
        self
    }

    /// `None` disables the link password entirely.
    pub fn with_invite_link_password(mut self, password: Option<Vec<u8>>) -> Self {
        self.invite_link_password = Some(password);
        self
    }

    pub fn with_announcements_only(mut self, announcements_only: bool) -> Self {
        self.announcements_only = Some(announcements_only);
        self
    }

    pub fn leaving_group(mut self) -> Self {
        self.leave = true;
        self
    }

    pub fn accepting_invite(mut self) -> Self {
        self.accept_invite = true;
        self
    }

    pub fn refreshing_profile_key(mut self) -> Self {
        self.refresh_profile_key = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct PendingChange {
    pub set: ChangeActionSet,
    /// A set containing nothing but a profile-key rotation should not
    /// produce a visible group-update message.
    pub silent: bool,
}

// ---------------------------------------------------------------------------
// OutgoingChangeBuilder
// ---------------------------------------------------------------------------

pub struct OutgoingChangeBuilder<'a> {
    cipher: &'a dyn GroupCipher,
    identity: &'a LocalIdentity,
    credentials: &'a dyn CredentialSource,
}

impl<'a> OutgoingChangeBuilder<'a> {
    pub fn new(
        cipher: &'a dyn GroupCipher,
        identity: &'a LocalIdentity,
        credentials: &'a dyn CredentialSource,
    ) -> Self {
        OutgoingChangeBuilder {
            cipher,
            identity,
            credentials,
        }
    }

    /// Build the minimal change set that takes `state` to the intended
    /// state, targeting `state.revision + 1`. `now_ms` stamps invites and
    /// bans.
    pub fn build(
        &self,
        state: &GroupState,
        intent: &ChangeIntent,
        now_ms: u64,
    ) -> Result<PendingChange, BuildError> {
        if state.placeholder {
            return Err(BuildError::PlaceholderState);
        }

        let me = self.identity.member;

        // Promoting ourselves or rotating our key presents our credentialed
        // profile key; without the credential the service would reject the
        // whole set.
        if (intent.accept_invite || intent.refresh_profile_key)
            && self.credentials.credential(&me).is_none()
        {
            return Err(BuildError::MissingCredential);
        }

        let mut actions = Vec::new();

        self.membership_actions(state, intent, now_ms, &mut actions)?;
        self.attribute_actions(state, intent, &mut actions)?;
        self.access_actions(state, intent, &mut actions);

        if intent.accept_invite {
            if !state.membership.is_invited(&me) {
                return Err(BuildError::Conflicting("no pending invite to accept".into()));
            }
            actions.push(ChangeAction::PromotePendingMember {
                user_id: self.cipher.encrypt_identifier(&me)?,
                profile_key: self.encrypt_own_key()?,
            });
        }

        if intent.leave {
            self.leave_actions(state, &mut actions)?;
        }

        if intent.refresh_profile_key {
            actions.push(ChangeAction::ModifyMemberProfileKey {
                user_id: self.cipher.encrypt_identifier(&me)?,
                profile_key: self.encrypt_own_key()?,
            });
        }

        if actions.is_empty() {
            return Err(BuildError::Redundant);
        }

        let silent = actions
            .iter()
            .all(|a| matches!(a, ChangeAction::ModifyMemberProfileKey { .. }));

        let mut set = ChangeActionSet::new(
            state.revision + 1,
            self.cipher.encrypt_identifier(&me)?,
            actions,
        );
        set.canonicalize();

        Ok(PendingChange { set, silent })
    }

    // -- membership ----------------------------------------------------------

    fn membership_actions(
        &self,
        state: &GroupState,
        intent: &ChangeIntent,
        now_ms: u64,
        actions: &mut Vec<ChangeAction>,
    ) -> Result<(), BuildError> {
        let me = self.identity.member;

        for member in &intent.add {
            if state.membership.is_full_member(member) {
                debug!("add of existing member {}, dropping", member);
                continue;
            }
            match self.credentials.credential(member) {
                Some(credential) => actions.push(ChangeAction::AddMember {
                    user_id: self.cipher.encrypt_identifier(member)?,
                    role: Role::Normal,
                    profile_key: self
                        .cipher
                        .encrypt_profile_key(credential.profile_key(), member)?,
                    joined_via_invite_link: false,
                }),
                // No credential on hand: the target must accept for
                // themselves, so this becomes an invite.
                None => {
                    if state.membership.is_invited(member) {
                        debug!("invite of already-invited {}, dropping", member);
                        continue;
                    }
                    actions.push(ChangeAction::AddPendingMember {
                        user_id: self.cipher.encrypt_identifier(member)?,
                        role: Role::Normal,
                        added_by: self.cipher.encrypt_identifier(&me)?,
                        timestamp_ms: now_ms,
                    });
                }
            }
        }

        for member in &intent.remove {
            if !state.membership.is_full_member(member) {
                debug!("remove of non-member {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::DeleteMember {
                user_id: self.cipher.encrypt_identifier(member)?,
            });
        }

        for (member, role) in &intent.roles {
            match state.membership.role_of(member) {
                None => {
                    return Err(BuildError::Conflicting(format!(
                        "role change for non-member {}",
                        member
                    )))
                }
                Some(current) if current == *role => {
                    debug!("role of {} already {:?}, dropping", member, role);
                }
                Some(_) => actions.push(ChangeAction::ModifyMemberRole {
                    user_id: self.cipher.encrypt_identifier(member)?,
                    role: *role,
                }),
            }
        }

        for member in &intent.approve {
            if state.membership.is_full_member(member) {
                debug!("approval of already-admitted {}, dropping", member);
                continue;
            }
            if !state.membership.is_requesting(member) {
                debug!("approval of vanished request {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::PromoteRequestingMember {
                user_id: self.cipher.encrypt_identifier(member)?,
                role: Role::Normal,
            });
        }

        for member in &intent.deny {
            if !state.membership.is_requesting(member) {
                debug!("denial of vanished request {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::DeleteRequestingMember {
                user_id: self.cipher.encrypt_identifier(member)?,
            });
        }

        for member in &intent.revoke_invites {
            if !state.membership.is_invited(member) {
                debug!("revocation of vanished invite {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::DeletePendingMember {
                user_id: self.cipher.encrypt_identifier(member)?,
            });
        }

        for ciphertext in &intent.revoke_invalid_invites {
            if !state.membership.invalid_invites().contains_key(ciphertext) {
                debug!("revocation of unknown unreadable invite, dropping");
                continue;
            }
            actions.push(ChangeAction::DeletePendingMember {
                user_id: ciphertext.clone(),
            });
        }

        for member in &intent.ban {
            // Banning also clears whatever standing the target currently has.
            if state.membership.is_full_member(member) {
                actions.push(ChangeAction::DeleteMember {
                    user_id: self.cipher.encrypt_identifier(member)?,
                });
            } else if state.membership.is_invited(member) {
                actions.push(ChangeAction::DeletePendingMember {
                    user_id: self.cipher.encrypt_identifier(member)?,
                });
            } else if state.membership.is_requesting(member) {
                actions.push(ChangeAction::DeleteRequestingMember {
                    user_id: self.cipher.encrypt_identifier(member)?,
                });
            }
            if state.membership.is_banned(member) {
                debug!("ban of already-banned {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::AddBannedMember {
                user_id: self.cipher.encrypt_identifier(member)?,
                banned_at_ms: now_ms,
            });
        }

        for member in &intent.unban {
            if !state.membership.is_banned(member) {
                debug!("unban of non-banned {}, dropping", member);
                continue;
            }
            actions.push(ChangeAction::DeleteBannedMember {
                user_id: self.cipher.encrypt_identifier(member)?,
            });
        }

        Ok(())
    }

    // -- attributes ----------------------------------------------------------

    fn attribute_actions(
        &self,
        state: &GroupState,
        intent: &ChangeIntent,
        actions: &mut Vec<ChangeAction>,
    ) -> Result<(), BuildError> {
        if let Some(title) = &intent.title {
            let desired = if title.is_empty() { None } else { Some(title.as_str()) };
            if desired != state.title.as_deref() {
                actions.push(ChangeAction::ModifyTitle {
                    blob: self.encrypt_attribute(&AttributeBlob::Title(title.clone()))?,
                });
            }
        }

        if let Some(description) = &intent.description {
            let desired = if description.is_empty() {
                None
            } else {
                Some(description.as_str())
            };
            if desired != state.description.as_deref() {
                actions.push(ChangeAction::ModifyDescription {
                    blob: self
                        .encrypt_attribute(&AttributeBlob::Description(description.clone()))?,
                });
            }
        }

        if let Some(avatar) = &intent.avatar {
            if *avatar != state.avatar {
                actions.push(ChangeAction::ModifyAvatar {
                    avatar: avatar.clone(),
                });
            }
        }

        if let Some(secs) = intent.timer_secs {
            if crate::state::DisappearingTimer::from_duration(secs) != state.timer {
                actions.push(ChangeAction::ModifyTimer {
                    blob: self.encrypt_attribute(&AttributeBlob::Timer(secs))?,
                });
            }
        }

        Ok(())
    }

    // -- access & settings ---------------------------------------------------

    fn access_actions(
        &self,
        state: &GroupState,
        intent: &ChangeIntent,
        actions: &mut Vec<ChangeAction>,
    ) {
        if let Some(access) = intent.members_access {
            if access != state.access.members {
                actions.push(ChangeAction::ModifyMembersAccess { access });
            }
        }
        if let Some(access) = intent.attributes_access {
            if access != state.access.attributes {
                actions.push(ChangeAction::ModifyAttributesAccess { access });
            }
        }
        if let Some(access) = intent.invite_link_access {
            if access != state.access.add_from_invite_link {
                actions.push(ChangeAction::ModifyInviteLinkAccess { access });
            }
        }
        if let Some(password) = &intent.invite_link_password {
            if *password != state.invite_link_password {
                actions.push(ChangeAction::ModifyInviteLinkPassword {
                    password: password.clone(),
                });
            }
        }
        if let Some(announcements_only) = intent.announcements_only {
            if announcements_only != state.announcements_only {
                actions.push(ChangeAction::ModifyAnnouncementsOnly { announcements_only });
            }
        }
    }

    // -- leaving -------------------------------------------------------------

    fn leave_actions(
        &self,
        state: &GroupState,
        actions: &mut Vec<ChangeAction>,
    ) -> Result<(), BuildError> {
        let me = self.identity.member;
        let user_id = self.cipher.encrypt_identifier(&me)?;

        if state.membership.is_full_member(&me) {
            // The last administrator walking out would leave an open invite
            // link pointing at a group no one can manage. Close it first.
            if state.membership.is_last_administrator(&me)
                && state.access.add_from_invite_link != AccessLevel::Unsatisfiable
            {
                actions.push(ChangeAction::ModifyInviteLinkAccess {
                    access: AccessLevel::Unsatisfiable,
                });
            }
            actions.push(ChangeAction::DeleteMember { user_id });
        } else if state.membership.is_invited(&me) {
            actions.push(ChangeAction::DeletePendingMember { user_id });
        } else if state.membership.is_requesting(&me) {
            actions.push(ChangeAction::DeleteRequestingMember { user_id });
        } else {
            debug!("leave requested but not a member in any category, dropping");
        }

        Ok(())
    }

    // -- helpers -------------------------------------------------------------

    fn encrypt_own_key(&self) -> Result<ProfileKeyCiphertext, CipherError> {
        self.cipher
            .encrypt_profile_key(&self.identity.profile_key, &self.identity.member)
    }

    fn encrypt_attribute(&self, blob: &AttributeBlob) -> Result<Vec<u8>, BuildError> {
        Ok(self.cipher.encrypt_blob(&blob.encode()?)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
