/// Deterministic change application: fold one `ChangeActionSet` into a
/// `GroupState` to produce the next revision.
///
/// The revision precondition is the only hard gate. Authority rules are
/// advisory: the service already enforced them when it committed the set, so
/// a violation here is logged and reported but never rejects the set;
/// rejecting would fork the replica from every other device.
use std::collections::BTreeMap;

use log::{debug, warn};
use thiserror::Error;

use crate::actions::{AttributeBlob, ChangeAction, ChangeActionSet};
use crate::cipher::GroupCipher;
use crate::ids::{MemberId, OpaqueUserId, ProfileKey, ProfileKeyCiphertext};
use crate::state::{FullMember, GroupState, InvitedMember, Role};
use crate::wire::EncryptedGroupSnapshot;

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// The set does not target the next revision. Callers re-sync and retry.
    #[error("change targets revision {actual}, local state is at {expected}")]
    RevisionMismatch { expected: u32, actual: u32 },

    /// The local model is a placeholder; changes cannot build on it. The
    /// orchestrator recovers with a snapshot fetch.
    #[error("cannot apply a change onto a placeholder state")]
    PlaceholderBase,

    /// An action carried data we cannot interpret and cannot safely skip.
    #[error("malformed {action}: {detail}")]
    MalformedAction {
        action: &'static str,
        detail: String,
    },
}

/// An action the committed set performed that its author did not appear
/// entitled to under the local view of the access controls. Reported, never
/// enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityViolation {
    pub author: MemberId,
    pub action: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub state: GroupState,
    pub author: MemberId,
    /// Profile keys learned along the way, for the contact layer.
    pub profile_keys: BTreeMap<MemberId, ProfileKey>,
    /// True when this set made the local user a full member and the local
    /// user authored it (invite-link join, accepting an invite).
    pub author_added_self: bool,
    pub violations: Vec<AuthorityViolation>,
}

/// Decrypted form of a service snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedSnapshot {
    pub state: GroupState,
    pub profile_keys: BTreeMap<MemberId, ProfileKey>,
}

// ---------------------------------------------------------------------------
// ChangeApplicator
// ---------------------------------------------------------------------------

pub struct ChangeApplicator<'a> {
    cipher: &'a dyn GroupCipher,
    local_member: MemberId,
}

impl<'a> ChangeApplicator<'a> {
    pub fn new(cipher: &'a dyn GroupCipher, local_member: MemberId) -> Self {
        ChangeApplicator {
            cipher,
            local_member,
        }
    }

    /// Apply `set` to `old`, producing the state at `old.revision + 1`.
    ///
    /// Re-application of the already-applied revision is a success no-op;
    /// the set is cross-checked against the state and discrepancies are
    /// logged. Any other revision gap is `RevisionMismatch`.
    pub fn apply(
        &self,
        old: &GroupState,
        set: &ChangeActionSet,
    ) -> Result<ApplyOutcome, ApplyError> {
        if old.placeholder {
            return Err(ApplyError::PlaceholderBase);
        }

        let author = self.decrypt_identifier(&set.author, "author")?;

        if set.revision == old.revision {
            self.verify_redundant(old, set);
            return Ok(ApplyOutcome {
                state: old.clone(),
                author,
                profile_keys: BTreeMap::new(),
                author_added_self: false,
                violations: Vec::new(),
            });
        }
        if set.revision != old.revision + 1 {
            return Err(ApplyError::RevisionMismatch {
                expected: old.revision,
                actual: set.revision,
            });
        }

        let mut next = old.clone();
        next.revision = set.revision;
        let mut profile_keys = BTreeMap::new();
        let mut violations = Vec::new();

        for action in &set.actions {
            self.apply_action(&mut next, action, set, &author, &mut profile_keys, &mut violations)?;
        }

        debug_assert!(next.membership.is_disjoint());

        let author_added_self = author == self.local_member
            && !old.membership.is_full_member(&self.local_member)
            && next.membership.is_full_member(&self.local_member);

        Ok(ApplyOutcome {
            state: next,
            author,
            profile_keys,
            author_added_self,
            violations,
        })
    }

    /// Decrypt a full snapshot into a complete state. Pending-member entries
    /// that fail identifier decryption become invalid invites; a decryption
    /// failure anywhere else is fatal, because the resulting state would be
    /// silently missing a real member.
    pub fn state_from_snapshot(
        &self,
        snapshot: &EncryptedGroupSnapshot,
    ) -> Result<DecryptedSnapshot, ApplyError> {
        let mut state = GroupState::empty();
        state.revision = snapshot.revision;
        state.access = snapshot.access;
        state.invite_link_password = snapshot.invite_link_password.clone();
        state.announcements_only = snapshot.announcements_only;
        state.avatar = snapshot.avatar.clone();

        if let Some(blob) = &snapshot.title_blob {
            state.title = self.decrypt_title(blob)?;
        }
        if let Some(blob) = &snapshot.description_blob {
            state.description = self.decrypt_description(blob)?;
        }
        if let Some(blob) = &snapshot.timer_blob {
            state.timer = self.decrypt_timer(blob)?;
        }

        let mut profile_keys = BTreeMap::new();

        for member in &snapshot.members {
            let id = self.decrypt_identifier(&member.user_id, "member")?;
            let key = self.decrypt_profile_key(&member.profile_key, &id, "member")?;
            state.membership.add_full_member(
                id,
                FullMember {
                    role: member.role,
                    joined_at_revision: member.joined_at_revision,
                },
            );
            profile_keys.insert(id, key);
        }

        for pending in &snapshot.pending_members {
            let added_by = self
                .cipher
                .decrypt_identifier(&pending.added_by)
                .unwrap_or(self.local_member);
            match self.cipher.decrypt_identifier(&pending.user_id) {
                Ok(id) => {
                    state.membership.add_invited_member(
                        id,
                        InvitedMember {
                            role: pending.role,
                            added_by,
                            timestamp_ms: pending.timestamp_ms,
                        },
                    );
                }
                Err(err) => {
                    debug!("unreadable pending member in snapshot: {}", err);
                    state
                        .membership
                        .add_invalid_invite(pending.user_id.clone(), added_by);
                }
            }
        }

        for requesting in &snapshot.requesting_members {
            let id = self.decrypt_identifier(&requesting.user_id, "requesting member")?;
            let key = self.decrypt_profile_key(&requesting.profile_key, &id, "requesting member")?;
            state.membership.add_requesting_member(id);
            profile_keys.insert(id, key);
        }

        for banned in &snapshot.banned_members {
            let id = self.decrypt_identifier(&banned.user_id, "banned member")?;
            state.membership.ban(id, banned.banned_at_ms);
        }

        Ok(DecryptedSnapshot {
            state,
            profile_keys,
        })
    }

    // -- per-action fold ----------------------------------------------------

    fn apply_action(
        &self,
        next: &mut GroupState,
        action: &ChangeAction,
        set: &ChangeActionSet,
        author: &MemberId,
        profile_keys: &mut BTreeMap<MemberId, ProfileKey>,
        violations: &mut Vec<AuthorityViolation>,
    ) -> Result<(), ApplyError> {
        let author_role = next.membership.role_of(author);

        match action {
            ChangeAction::AddMember {
                user_id,
                role,
                profile_key,
                joined_via_invite_link,
            } => {
                let id = self.decrypt_identifier(user_id, "AddMember")?;
                let key = self.decrypt_profile_key(profile_key, &id, "AddMember")?;

                let entitled = if *joined_via_invite_link {
                    next.access
                        .add_from_invite_link
                        .satisfied_by(next.membership.role_of(&id))
                        || id == *author
                } else {
                    next.can_edit_membership(author)
                };
                if !entitled {
                    self.violation(violations, *author, "AddMember", "author may not add members");
                }
                if *role == Role::Administrator && author_role != Some(Role::Administrator) {
                    self.violation(
                        violations,
                        *author,
                        "AddMember",
                        "only an administrator may add an administrator",
                    );
                }
                if next.membership.is_banned(&id) {
                    self.violation(violations, *author, "AddMember", "target is banned");
                    next.membership.unban(&id);
                }

                next.membership.add_full_member(
                    id,
                    FullMember {
                        role: *role,
                        joined_at_revision: set.revision,
                    },
                );
                profile_keys.insert(id, key);
            }

            ChangeAction::DeleteMember { user_id } => {
                let id = self.decrypt_identifier(user_id, "DeleteMember")?;
                if id != *author && !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "DeleteMember",
                        "author may not remove members",
                    );
                }
                if next.membership.remove_full_member(&id).is_none() {
                    debug!("DeleteMember for non-member {}, skipping", id);
                }
            }

            ChangeAction::ModifyMemberRole { user_id, role } => {
                let id = self.decrypt_identifier(user_id, "ModifyMemberRole")?;
                if author_role != Some(Role::Administrator) {
                    self.violation(
                        violations,
                        *author,
                        "ModifyMemberRole",
                        "only an administrator may change roles",
                    );
                }
                match next.membership.remove_full_member(&id) {
                    Some(entry) => {
                        next.membership.add_full_member(
                            id,
                            FullMember {
                                role: *role,
                                ..entry
                            },
                        );
                    }
                    None => debug!("ModifyMemberRole for non-member {}, skipping", id),
                }
            }

            ChangeAction::AddPendingMember {
                user_id,
                role,
                added_by,
                timestamp_ms,
            } => {
                if !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "AddPendingMember",
                        "author may not invite members",
                    );
                }
                let inviter = self
                    .cipher
                    .decrypt_identifier(added_by)
                    .unwrap_or(*author);
                match self.cipher.decrypt_identifier(user_id) {
                    Ok(id) => {
                        if next.membership.is_full_member(&id) {
                            debug!("AddPendingMember for full member {}, skipping", id);
                        } else {
                            next.membership.add_invited_member(
                                id,
                                InvitedMember {
                                    role: *role,
                                    added_by: inviter,
                                    timestamp_ms: *timestamp_ms,
                                },
                            );
                        }
                    }
                    // Invites encrypted for another identity's keys come out
                    // unreadable here. Track the ciphertext so revocation and
                    // counts still work.
                    Err(err) => {
                        debug!("unreadable invite: {}", err);
                        next.membership.add_invalid_invite(user_id.clone(), inviter);
                    }
                }
            }

            ChangeAction::DeletePendingMember { user_id } => {
                match self.cipher.decrypt_identifier(user_id) {
                    Ok(id) => {
                        if id != *author && !next.can_edit_membership(author) {
                            self.violation(
                                violations,
                                *author,
                                "DeletePendingMember",
                                "author may not revoke invites",
                            );
                        }
                        if next.membership.remove_invited_member(&id).is_none() {
                            debug!("DeletePendingMember for non-invitee {}, skipping", id);
                        }
                    }
                    Err(_) => {
                        if !next.membership.remove_invalid_invite(user_id) {
                            debug!("DeletePendingMember for unknown unreadable invite, skipping");
                        }
                    }
                }
            }

            ChangeAction::PromotePendingMember {
                user_id,
                profile_key,
            } => {
                let id = self.decrypt_identifier(user_id, "PromotePendingMember")?;
                let key = self.decrypt_profile_key(profile_key, &id, "PromotePendingMember")?;
                if id != *author {
                    self.violation(
                        violations,
                        *author,
                        "PromotePendingMember",
                        "only the invitee may accept an invite",
                    );
                }
                let role = match next.membership.remove_invited_member(&id) {
                    Some(entry) => entry.role,
                    None => {
                        debug!("PromotePendingMember for non-invitee {}", id);
                        self.violation(
                            violations,
                            *author,
                            "PromotePendingMember",
                            "target was not invited",
                        );
                        Role::Normal
                    }
                };
                next.membership.add_full_member(
                    id,
                    FullMember {
                        role,
                        joined_at_revision: set.revision,
                    },
                );
                profile_keys.insert(id, key);
            }

            ChangeAction::AddRequestingMember {
                user_id,
                profile_key,
                ..
            } => {
                let id = self.decrypt_identifier(user_id, "AddRequestingMember")?;
                let key = self.decrypt_profile_key(profile_key, &id, "AddRequestingMember")?;
                if next.membership.is_banned(&id) {
                    // A committed join request from a banned identity should
                    // not exist; keep the ban authoritative.
                    self.violation(
                        violations,
                        *author,
                        "AddRequestingMember",
                        "target is banned",
                    );
                    return Ok(());
                }
                next.membership.add_requesting_member(id);
                profile_keys.insert(id, key);
            }

            ChangeAction::DeleteRequestingMember { user_id } => {
                let id = self.decrypt_identifier(user_id, "DeleteRequestingMember")?;
                if id != *author && !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "DeleteRequestingMember",
                        "author may not deny join requests",
                    );
                }
                if !next.membership.remove_requesting_member(&id) {
                    debug!("DeleteRequestingMember for non-requester {}, skipping", id);
                }
            }

            ChangeAction::PromoteRequestingMember { user_id, role } => {
                let id = self.decrypt_identifier(user_id, "PromoteRequestingMember")?;
                if !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "PromoteRequestingMember",
                        "author may not approve join requests",
                    );
                }
                if !next.membership.remove_requesting_member(&id) {
                    debug!("PromoteRequestingMember for non-requester {}", id);
                    self.violation(
                        violations,
                        *author,
                        "PromoteRequestingMember",
                        "target was not requesting",
                    );
                }
                next.membership.add_full_member(
                    id,
                    FullMember {
                        role: *role,
                        joined_at_revision: set.revision,
                    },
                );
            }

            ChangeAction::AddBannedMember {
                user_id,
                banned_at_ms,
            } => {
                let id = self.decrypt_identifier(user_id, "AddBannedMember")?;
                if !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "AddBannedMember",
                        "author may not ban members",
                    );
                }
                next.membership.ban(id, *banned_at_ms);
            }

            ChangeAction::DeleteBannedMember { user_id } => {
                let id = self.decrypt_identifier(user_id, "DeleteBannedMember")?;
                if !next.can_edit_membership(author) {
                    self.violation(
                        violations,
                        *author,
                        "DeleteBannedMember",
                        "author may not lift bans",
                    );
                }
                if !next.membership.unban(&id) {
                    debug!("DeleteBannedMember for non-banned {}, skipping", id);
                }
            }

            ChangeAction::ModifyTitle { blob } => {
                self.check_attribute_edit(next, author, "ModifyTitle", violations);
                next.title = self.decrypt_title(blob)?;
            }

            ChangeAction::ModifyDescription { blob } => {
                self.check_attribute_edit(next, author, "ModifyDescription", violations);
                next.description = self.decrypt_description(blob)?;
            }

            ChangeAction::ModifyAvatar { avatar } => {
                self.check_attribute_edit(next, author, "ModifyAvatar", violations);
                next.avatar = avatar.clone();
            }

            ChangeAction::ModifyTimer { blob } => {
                self.check_attribute_edit(next, author, "ModifyTimer", violations);
                next.timer = self.decrypt_timer(blob)?;
            }

            ChangeAction::ModifyMembersAccess { access } => {
                self.check_admin(author_role, author, "ModifyMembersAccess", violations);
                next.access.members = *access;
            }

            ChangeAction::ModifyAttributesAccess { access } => {
                self.check_admin(author_role, author, "ModifyAttributesAccess", violations);
                next.access.attributes = *access;
            }

            ChangeAction::ModifyInviteLinkAccess { access } => {
                self.check_admin(author_role, author, "ModifyInviteLinkAccess", violations);
                next.access.add_from_invite_link = *access;
            }

            ChangeAction::ModifyInviteLinkPassword { password } => {
                self.check_admin(author_role, author, "ModifyInviteLinkPassword", violations);
                next.invite_link_password = password.clone();
            }

            ChangeAction::ModifyAnnouncementsOnly { announcements_only } => {
                self.check_admin(author_role, author, "ModifyAnnouncementsOnly", violations);
                next.announcements_only = *announcements_only;
            }

            ChangeAction::ModifyMemberProfileKey {
                user_id,
                profile_key,
            } => {
                let id = self.decrypt_identifier(user_id, "ModifyMemberProfileKey")?;
                let key = self.decrypt_profile_key(profile_key, &id, "ModifyMemberProfileKey")?;
                if id != *author {
                    self.violation(
                        violations,
                        *author,
                        "ModifyMemberProfileKey",
                        "only the member may rotate their own profile key",
                    );
                }
                profile_keys.insert(id, key);
            }
        }

        Ok(())
    }

    // -- redundant re-application ------------------------------------------

    /// Cross-check a set that matches the current revision against the state
    /// it should already be reflected in. A mismatch means this replica and
    /// the service disagree; we log it loudly and carry on.
    fn verify_redundant(&self, state: &GroupState, set: &ChangeActionSet) {
        for action in &set.actions {
            let consistent = match action {
                ChangeAction::AddMember { user_id, .. }
                | ChangeAction::PromotePendingMember { user_id, .. }
                | ChangeAction::PromoteRequestingMember { user_id, .. } => self
                    .cipher
                    .decrypt_identifier(user_id)
                    .map(|id| state.membership.is_full_member(&id))
                    .unwrap_or(true),
                ChangeAction::DeleteMember { user_id } => self
                    .cipher
                    .decrypt_identifier(user_id)
                    .map(|id| !state.membership.is_full_member(&id))
                    .unwrap_or(true),
                ChangeAction::AddBannedMember { user_id, .. } => self
                    .cipher
                    .decrypt_identifier(user_id)
                    .map(|id| state.membership.is_banned(&id))
                    .unwrap_or(true),
                ChangeAction::DeleteBannedMember { user_id } => self
                    .cipher
                    .decrypt_identifier(user_id)
                    .map(|id| !state.membership.is_banned(&id))
                    .unwrap_or(true),
                _ => true,
            };
            if !consistent {
                warn!(
                    "redundant change at revision {} is not reflected in local state ({})",
                    set.revision,
                    action.kind()
                );
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn decrypt_identifier(
        &self,
        user_id: &OpaqueUserId,
        action: &'static str,
    ) -> Result<MemberId, ApplyError> {
        self.cipher
            .decrypt_identifier(user_id)
            .map_err(|e| ApplyError::MalformedAction {
                action,
                detail: format!("identifier: {}", e),
            })
    }

    fn decrypt_profile_key(
        &self,
        ciphertext: &ProfileKeyCiphertext,
        member: &MemberId,
        action: &'static str,
    ) -> Result<ProfileKey, ApplyError> {
        self.cipher
            .decrypt_profile_key(ciphertext, member)
            .map_err(|e| ApplyError::MalformedAction {
                action,
                detail: format!("profile key: {}", e),
            })
    }

    fn decrypt_title(&self, blob: &[u8]) -> Result<Option<String>, ApplyError> {
        match self.decrypt_attribute(blob, "ModifyTitle")? {
            AttributeBlob::Title(s) if s.is_empty() => Ok(None),
            AttributeBlob::Title(s) => Ok(Some(s)),
            other => Err(wrong_blob("ModifyTitle", &other)),
        }
    }

    fn decrypt_description(&self, blob: &[u8]) -> Result<Option<String>, ApplyError> {
        match self.decrypt_attribute(blob, "ModifyDescription")? {
            AttributeBlob::Description(s) if s.is_empty() => Ok(None),
            AttributeBlob::Description(s) => Ok(Some(s)),
            other => Err(wrong_blob("ModifyDescription", &other)),
        }
    }

    fn decrypt_timer(&self, blob: &[u8]) -> Result<crate::state::DisappearingTimer, ApplyError> {
        match self.decrypt_attribute(blob, "ModifyTimer")? {
            AttributeBlob::Timer(secs) => Ok(crate::state::DisappearingTimer::from_duration(secs)),
            other => Err(wrong_blob("ModifyTimer", &other)),
        }
    }

    fn decrypt_attribute(
        &self,
        blob: &[u8],
        action: &'static str,
    ) -> Result<AttributeBlob, ApplyError> {
        let plaintext =
            self.cipher
                .decrypt_blob(blob)
                .map_err(|e| ApplyError::MalformedAction {
                    action,
                    detail: format!("blob: {}", e),
                })?;
        AttributeBlob::decode(&plaintext).map_err(|e| ApplyError::MalformedAction {
            action,
            detail: e.to_string(),
        })
    }

    fn check_attribute_edit(
        &self,
        state: &GroupState,
        author: &MemberId,
        action: &'static str,
        violations: &mut Vec<AuthorityViolation>,
    ) {
        if !state.can_edit_attributes(author) {
            self.violation(violations, *author, action, "author may not edit attributes");
        }
    }

    fn check_admin(
        &self,
        author_role: Option<Role>,
        author: &MemberId,
        action: &'static str,
        violations: &mut Vec<AuthorityViolation>,
    ) {
        if author_role != Some(Role::Administrator) {
            self.violation(violations, *author, action, "administrator required");
        }
    }

    fn violation(
        &self,
        violations: &mut Vec<AuthorityViolation>,
        author: MemberId,
        action: &'static str,
        detail: &str,
    ) {
        warn!("{} by {}: {}", action, author, detail);
        violations.push(AuthorityViolation {
            author,
            action,
            detail: detail.to_string(),
        });
    }
}

fn wrong_blob(action: &'static str, got: &AttributeBlob) -> ApplyError {
    ApplyError::MalformedAction {
        action,
        detail: format!("unexpected attribute payload {:?}", got),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AccessLevel;
    use crate::test_utils::{
        admin_state, enc_key, enc_uid, member_id, TestCipher,
    };

    fn applicator<'a>(cipher: &'a TestCipher, local: MemberId) -> ChangeApplicator<'a> {
        ChangeApplicator::new(cipher, local)
    }

    fn add_member_action(cipher: &TestCipher, id: MemberId, role: Role) -> ChangeAction {
        ChangeAction::AddMember {
            user_id: enc_uid(cipher, id),
            role,
            profile_key: enc_key(cipher, id),
            joined_via_invite_link: false,
        }
    }

    #[test]
    fn test_revision_gap_is_rejected() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 5);
        let app = applicator(&cipher, admin);

        for bad in [7, 9, 4, 0] {
            let set = ChangeActionSet::new(bad, enc_uid(&cipher, admin), vec![]);
            assert_eq!(
                app.apply(&state, &set),
                Err(ApplyError::RevisionMismatch {
                    expected: 5,
                    actual: bad
                })
            );
        }
    }

    #[test]
    fn test_redundant_revision_is_a_no_op() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 5);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            5,
            enc_uid(&cipher, admin),
            vec![add_member_action(&cipher, member_id(9), Role::Normal)],
        );
        let outcome = app.apply(&state, &set).unwrap();
        assert_eq!(outcome.state, state);
        assert!(outcome.profile_keys.is_empty());
    }

    #[test]
    fn test_placeholder_base_is_rejected() {
        let cipher = TestCipher::new();
        let me = member_id(1);
        let state = GroupState::placeholder(5, me);
        let app = applicator(&cipher, me);

        let set = ChangeActionSet::new(6, enc_uid(&cipher, me), vec![]);
        assert_eq!(app.apply(&state, &set), Err(ApplyError::PlaceholderBase));
    }

    #[test]
    fn test_add_member_yields_member_and_profile_key() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let newcomer = member_id(2);
        let state = admin_state(&cipher, admin, 5);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            6,
            enc_uid(&cipher, admin),
            vec![add_member_action(&cipher, newcomer, Role::Normal)],
        );
        let outcome = app.apply(&state, &set).unwrap();

        assert_eq!(outcome.state.revision, 6);
        assert!(outcome.state.membership.is_full_member(&newcomer));
        assert_eq!(
            outcome
                .state
                .membership
                .full_members()
                .get(&newcomer)
                .unwrap()
                .joined_at_revision,
            6
        );
        assert!(outcome.profile_keys.contains_key(&newcomer));
        assert!(outcome.violations.is_empty());
        assert!(!outcome.author_added_self);
    }

    #[test]
    fn test_apply_is_deterministic_byte_for_byte() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 5);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            6,
            enc_uid(&cipher, admin),
            vec![
                add_member_action(&cipher, member_id(4), Role::Normal),
                add_member_action(&cipher, member_id(3), Role::Normal),
                ChangeAction::ModifyAnnouncementsOnly {
                    announcements_only: true,
                },
            ],
        );

        let a = app.apply(&state, &set).unwrap().state;
        let b = app.apply(&state, &set).unwrap().state;
        assert_eq!(
            bincode::serialize(&a).unwrap(),
            bincode::serialize(&b).unwrap()
        );
    }

    #[test]
    fn test_invite_then_accept() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let invitee = member_id(2);
        let state = admin_state(&cipher, admin, 1);
        let app = applicator(&cipher, invitee);

        let invite = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![ChangeAction::AddPendingMember {
                user_id: enc_uid(&cipher, invitee),
                role: Role::Normal,
                added_by: enc_uid(&cipher, admin),
                timestamp_ms: 1_000,
            }],
        );
        let state = app.apply(&state, &invite).unwrap().state;
        assert!(state.membership.is_invited(&invitee));

        let accept = ChangeActionSet::new(
            3,
            enc_uid(&cipher, invitee),
            vec![ChangeAction::PromotePendingMember {
                user_id: enc_uid(&cipher, invitee),
                profile_key: enc_key(&cipher, invitee),
            }],
        );
        let outcome = app.apply(&state, &accept).unwrap();
        assert!(outcome.state.membership.is_full_member(&invitee));
        assert!(!outcome.state.membership.is_invited(&invitee));
        assert!(outcome.author_added_self);
        assert!(outcome.state.membership.is_disjoint());
    }

    #[test]
    fn test_unreadable_invite_becomes_invalid_invite() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 1);
        let app = applicator(&cipher, admin);

        let garbage = OpaqueUserId::from_bytes(vec![0xde, 0xad]);
        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![ChangeAction::AddPendingMember {
                user_id: garbage.clone(),
                role: Role::Normal,
                added_by: enc_uid(&cipher, admin),
                timestamp_ms: 0,
            }],
        );
        let state = app.apply(&state, &set).unwrap().state;
        assert_eq!(state.membership.invalid_invites().get(&garbage), Some(&admin));
        assert!(state.membership.invited_members().is_empty());

        // Revoking the unreadable invite clears it again.
        let revoke = ChangeActionSet::new(
            3,
            enc_uid(&cipher, admin),
            vec![ChangeAction::DeletePendingMember { user_id: garbage }],
        );
        let state = app.apply(&state, &revoke).unwrap().state;
        assert!(state.membership.invalid_invites().is_empty());
    }

    #[test]
    fn test_unreadable_full_member_is_fatal() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 1);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![ChangeAction::AddMember {
                user_id: OpaqueUserId::from_bytes(vec![0xff]),
                role: Role::Normal,
                profile_key: enc_key(&cipher, member_id(2)),
                joined_via_invite_link: false,
            }],
        );
        assert!(matches!(
            app.apply(&state, &set),
            Err(ApplyError::MalformedAction {
                action: "AddMember",
                ..
            })
        ));
    }

    #[test]
    fn test_non_admin_access_change_is_applied_with_violation() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let plain = member_id(2);
        let mut state = admin_state(&cipher, admin, 1);
        state.membership.add_full_member(
            plain,
            FullMember {
                role: Role::Normal,
                joined_at_revision: 1,
            },
        );
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, plain),
            vec![ChangeAction::ModifyMembersAccess {
                access: AccessLevel::Administrator,
            }],
        );
        let outcome = app.apply(&state, &set).unwrap();
        // Committed by the service, so it lands; the discrepancy is reported.
        assert_eq!(outcome.state.access.members, AccessLevel::Administrator);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].action, "ModifyMembersAccess");
    }

    #[test]
    fn test_title_clear_and_set() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 1);
        let app = applicator(&cipher, admin);

        let blob = cipher
            .encrypt_blob(&AttributeBlob::Title("book club".into()).encode().unwrap())
            .unwrap();
        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![ChangeAction::ModifyTitle { blob }],
        );
        let state = app.apply(&state, &set).unwrap().state;
        assert_eq!(state.title.as_deref(), Some("book club"));

        let blob = cipher
            .encrypt_blob(&AttributeBlob::Title(String::new()).encode().unwrap())
            .unwrap();
        let set = ChangeActionSet::new(
            3,
            enc_uid(&cipher, admin),
            vec![ChangeAction::ModifyTitle { blob }],
        );
        let state = app.apply(&state, &set).unwrap().state;
        assert_eq!(state.title, None);
    }

    #[test]
    fn test_ban_drops_invite_and_request() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let target = member_id(2);
        let mut state = admin_state(&cipher, admin, 1);
        state.membership.add_requesting_member(target);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![
                ChangeAction::DeleteRequestingMember {
                    user_id: enc_uid(&cipher, target),
                },
                ChangeAction::AddBannedMember {
                    user_id: enc_uid(&cipher, target),
                    banned_at_ms: 99,
                },
            ],
        );
        let state = app.apply(&state, &set).unwrap().state;
        assert!(state.membership.is_banned(&target));
        assert!(!state.membership.is_requesting(&target));
        assert!(state.membership.is_disjoint());
    }

    #[test]
    fn test_join_request_from_banned_identity_is_skipped() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let outcast = member_id(2);
        let mut state = admin_state(&cipher, admin, 1);
        state.membership.ban(outcast, 5);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, outcast),
            vec![ChangeAction::AddRequestingMember {
                user_id: enc_uid(&cipher, outcast),
                profile_key: enc_key(&cipher, outcast),
                timestamp_ms: 7,
            }],
        );
        let outcome = app.apply(&state, &set).unwrap();
        assert!(!outcome.state.membership.is_requesting(&outcast));
        assert!(outcome.state.membership.is_banned(&outcast));
        assert_eq!(outcome.violations.len(), 1);
    }

    #[test]
    fn test_profile_key_rotation_fills_sidecar_only() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let state = admin_state(&cipher, admin, 1);
        let app = applicator(&cipher, admin);

        let set = ChangeActionSet::new(
            2,
            enc_uid(&cipher, admin),
            vec![ChangeAction::ModifyMemberProfileKey {
                user_id: enc_uid(&cipher, admin),
                profile_key: enc_key(&cipher, admin),
            }],
        );
        let outcome = app.apply(&state, &set).unwrap();
        assert!(outcome.profile_keys.contains_key(&admin));
        let mut expected = state.clone();
        expected.revision = 2;
        assert_eq!(outcome.state, expected);
    }

    #[test]
    fn test_snapshot_roundtrips_into_state() {
        let cipher = TestCipher::new();
        let admin = member_id(1);
        let invitee = member_id(2);
        let app = applicator(&cipher, admin);

        let snapshot = crate::test_utils::snapshot_with(
            &cipher,
            7,
            &[(admin, Role::Administrator)],
            &[(invitee, admin)],
        );
        let decrypted = app.state_from_snapshot(&snapshot).unwrap();

        assert_eq!(decrypted.state.revision, 7);
        assert!(decrypted.state.membership.is_full_member(&admin));
        assert!(decrypted.state.membership.is_invited(&invitee));
        assert!(!decrypted.state.placeholder);
        assert!(decrypted.profile_keys.contains_key(&admin));
    }
}
