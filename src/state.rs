/// Canonical in-memory model of a replicated group: pure data plus invariant
/// checks, no behavior.
///
/// A `GroupState` is an immutable value per revision: the applicator derives
/// state N+1 from state N and never mutates a published state in place. All
/// member collections are `BTreeMap`/`BTreeSet` so that equal states serialize
/// to identical bytes.
///
/// Membership categories (full, invited, requesting) are mutually exclusive;
/// the banned list is independent of the other three. `GroupMembership`
/// enforces the disjointness at every mutation.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{MemberId, OpaqueUserId};
use crate::limits::MAX_BANNED_MEMBERS;

// ---------------------------------------------------------------------------
// Role & access levels
// ---------------------------------------------------------------------------

/// Role of a full (or invited) member.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Normal = 1,
    Administrator = 2,
}

/// Access required to perform a class of group edits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AccessLevel {
    Unknown = 0,
    Any = 1,
    Member = 2,
    Administrator = 3,
    /// No one can satisfy this; used to permanently disable invite links.
    Unsatisfiable = 4,
}

impl AccessLevel {
    /// Whether a member with the given role (or a non-member, `None`)
    /// satisfies this access level.
    pub fn satisfied_by(&self, role: Option<Role>) -> bool {
        match self {
            AccessLevel::Any => true,
            AccessLevel::Member => role.is_some(),
            AccessLevel::Administrator => role == Some(Role::Administrator),
            AccessLevel::Unknown | AccessLevel::Unsatisfiable => false,
        }
    }
}

/// Access controls for the three classes of group edits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessControls {
    pub members: AccessLevel,
    pub attributes: AccessLevel,
    pub add_from_invite_link: AccessLevel,
}

impl Default for AccessControls {
    fn default() -> Self {
        AccessControls {
            members: AccessLevel::Member,
            attributes: AccessLevel::Member,
            add_from_invite_link: AccessLevel::Unsatisfiable,
        }
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Disappearing-message timer. A duration of zero means disabled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisappearingTimer {
    pub enabled: bool,
    pub duration_secs: u32,
}

impl DisappearingTimer {
    pub fn disabled() -> Self {
        DisappearingTimer {
            enabled: false,
            duration_secs: 0,
        }
    }

    pub fn from_duration(duration_secs: u32) -> Self {
        DisappearingTimer {
            enabled: duration_secs > 0,
            duration_secs,
        }
    }
}

/// Reference to the group avatar. Owning both the service url path and the
/// downloaded bytes in one struct keeps the "both present or both absent"
/// invariant structural: state holds `Option<AvatarRef>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AvatarRef {
    pub url_path: String,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Membership entries
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullMember {
    pub role: Role,
    /// Revision at which this member joined (0 when unknown).
    pub joined_at_revision: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InvitedMember {
    pub role: Role,
    pub added_by: MemberId,
    /// Service timestamp of the invite, epoch millis.
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// GroupMembership
// ---------------------------------------------------------------------------

/// Per-identity membership with mutually exclusive non-banned categories.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct GroupMembership {
    full_members: BTreeMap<MemberId, FullMember>,
    invited_members: BTreeMap<MemberId, InvitedMember>,
    requesting_members: BTreeSet<MemberId>,
    /// Member id -> ban timestamp (epoch millis), bounded by
    /// `MAX_BANNED_MEMBERS` with strictly-oldest-first eviction.
    banned_members: BTreeMap<MemberId, u64>,
    /// Invites whose identifier ciphertext could not be decrypted, keyed by
    /// the ciphertext so they can later be revoked, with the inviter.
    invalid_invites: BTreeMap<OpaqueUserId, MemberId>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    // -- queries ------------------------------------------------------------

    pub fn full_members(&self) -> &BTreeMap<MemberId, FullMember> {
        &self.full_members
    }

    pub fn invited_members(&self) -> &BTreeMap<MemberId, InvitedMember> {
        &self.invited_members
    }

    pub fn requesting_members(&self) -> &BTreeSet<MemberId> {
        &self.requesting_members
    }

    pub fn banned_members(&self) -> &BTreeMap<MemberId, u64> {
        &self.banned_members
    }

    pub fn invalid_invites(&self) -> &BTreeMap<OpaqueUserId, MemberId> {
        &self.invalid_invites
    }

    pub fn role_of(&self, member: &MemberId) -> Option<Role> {
        self.full_members.get(member).map(|m| m.role)
    }

    pub fn is_full_member(&self, member: &MemberId) -> bool {
        self.full_members.contains_key(member)
    }

    pub fn is_invited(&self, member: &MemberId) -> bool {
        self.invited_members.contains_key(member)
    }

    pub fn is_requesting(&self, member: &MemberId) -> bool {
        self.requesting_members.contains(member)
    }

    pub fn is_banned(&self, member: &MemberId) -> bool {
        self.banned_members.contains_key(member)
    }

    /// Member of any non-banned category.
    pub fn is_member_of_any_kind(&self, member: &MemberId) -> bool {
        self.is_full_member(member) || self.is_invited(member) || self.is_requesting(member)
    }

    pub fn administrator_count(&self) -> usize {
        self.full_members
            .values()
            .filter(|m| m.role == Role::Administrator)
            .count()
    }

    /// True when `member` is an administrator and no other administrator
    /// exists, the at-least-one-admin safety pivot.
    pub fn is_last_administrator(&self, member: &MemberId) -> bool {
        self.role_of(member) == Some(Role::Administrator) && self.administrator_count() == 1
    }

    /// The non-banned categories must be pairwise disjoint.
    pub fn is_disjoint(&self) -> bool {
        self.full_members
            .keys()
            .all(|m| !self.invited_members.contains_key(m) && !self.requesting_members.contains(m))
            && self
                .invited_members
                .keys()
                .all(|m| !self.requesting_members.contains(m))
    }

    // -- mutations (used by the applicator and migration) -------------------

    /// Insert a full member, displacing any invited/requesting entry so the
    /// categories stay disjoint.
    pub fn add_full_member(&mut self, member: MemberId, entry: FullMember) {
        self.invited_members.remove(&member);
        self.requesting_members.remove(&member);
        self.full_members.insert(member, entry);
    }

    pub fn remove_full_member(&mut self, member: &MemberId) -> Option<FullMember> {
        self.full_members.remove(member)
    }

    pub fn add_invited_member(&mut self, member: MemberId, entry: InvitedMember) {
        self.full_members.remove(&member);
        self.requesting_members.remove(&member);
        self.invited_members.insert(member, entry);
    }

    pub fn remove_invited_member(&mut self, member: &MemberId) -> Option<InvitedMember> {
        self.invited_members.remove(member)
    }

    pub fn add_requesting_member(&mut self, member: MemberId) {
        self.full_members.remove(&member);
        self.invited_members.remove(&member);
        self.requesting_members.insert(member);
    }

    pub fn remove_requesting_member(&mut self, member: &MemberId) -> bool {
        self.requesting_members.remove(member)
    }

    /// Ban an identity. Any invited or requesting entry is dropped (the ban is
    /// authoritative over transient categories). The ban list is bounded:
    /// on overflow the strictly oldest ban is evicted first, tie-break by
    /// member id ordering.
    pub fn ban(&mut self, member: MemberId, banned_at_ms: u64) {
        self.invited_members.remove(&member);
        self.requesting_members.remove(&member);
        self.banned_members.insert(member, banned_at_ms);

        while self.banned_members.len() > MAX_BANNED_MEMBERS {
            let oldest = self
                .banned_members
                .iter()
                .min_by_key(|(id, at)| (**at, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.banned_members.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn unban(&mut self, member: &MemberId) -> bool {
        self.banned_members.remove(member).is_some()
    }

    pub fn add_invalid_invite(&mut self, ciphertext: OpaqueUserId, added_by: MemberId) {
        self.invalid_invites.insert(ciphertext, added_by);
    }

    pub fn remove_invalid_invite(&mut self, ciphertext: &OpaqueUserId) -> bool {
        self.invalid_invites.remove(ciphertext).is_some()
    }
}

// ---------------------------------------------------------------------------
// GroupState
// ---------------------------------------------------------------------------

/// Full replica state at one revision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupState {
    /// Strictly increasing; the canonical ordering key.
    pub revision: u32,
    /// `None` means "cleared", not "unknown".
    pub title: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<AvatarRef>,
    pub membership: GroupMembership,
    pub access: AccessControls,
    pub invite_link_password: Option<Vec<u8>>,
    pub timer: DisappearingTimer,
    pub announcements_only: bool,
    /// Locally-synthesized incomplete record, created when we have requested
    /// to join but cannot yet read the full group state.
    pub placeholder: bool,
}

impl GroupState {
    /// Empty state at revision 0, the base a brand-new replica builds on.
    pub fn empty() -> Self {
        GroupState {
            revision: 0,
            title: None,
            description: None,
            avatar: None,
            membership: GroupMembership::new(),
            access: AccessControls::default(),
            invite_link_password: None,
            timer: DisappearingTimer::disabled(),
            announcements_only: false,
            placeholder: false,
        }
    }

    /// Placeholder record for a group we asked to join via invite link but
    /// cannot yet read.
    pub fn placeholder(revision: u32, requester: MemberId) -> Self {
        let mut state = GroupState::empty();
        state.revision = revision;
        state.placeholder = true;
        state.membership.add_requesting_member(requester);
        state
    }

    /// Whether `member` may edit group attributes (title, avatar, timer, ...).
    pub fn can_edit_attributes(&self, member: &MemberId) -> bool {
        self.access
            .attributes
            .satisfied_by(self.membership.role_of(member))
    }

    /// Whether `member` may edit membership (add, remove, re-role).
    pub fn can_edit_membership(&self, member: &MemberId) -> bool {
        self.access
            .members
            .satisfied_by(self.membership.role_of(member))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn member(n: u128) -> MemberId {
        MemberId::new(Uuid::from_u128(n))
    }

    fn full(role: Role) -> FullMember {
        FullMember {
            role,
            joined_at_revision: 0,
        }
    }

    #[test]
    fn test_categories_stay_disjoint() {
        let mut m = GroupMembership::new();
        let a = member(1);

        m.add_requesting_member(a);
        assert!(m.is_requesting(&a));

        m.add_invited_member(
            a,
            InvitedMember {
                role: Role::Normal,
                added_by: member(2),
                timestamp_ms: 1,
            },
        );
        assert!(m.is_invited(&a));
        assert!(!m.is_requesting(&a));
        assert!(m.is_disjoint());

        m.add_full_member(a, full(Role::Normal));
        assert!(m.is_full_member(&a));
        assert!(!m.is_invited(&a));
        assert!(m.is_disjoint());
    }

    #[test]
    fn test_ban_drops_transient_categories() {
        let mut m = GroupMembership::new();
        let a = member(1);
        m.add_requesting_member(a);

        m.ban(a, 100);
        assert!(m.is_banned(&a));
        assert!(!m.is_requesting(&a));
        assert!(!m.is_member_of_any_kind(&a));
    }

    #[test]
    fn test_ban_eviction_oldest_first() {
        let mut m = GroupMembership::new();
        for i in 0..MAX_BANNED_MEMBERS {
            // Ban times increase with i; member 0 is the oldest ban.
            m.ban(member(i as u128), 1_000 + i as u64);
        }
        assert_eq!(m.banned_members().len(), MAX_BANNED_MEMBERS);

        m.ban(member(9_999), 50_000);
        assert_eq!(m.banned_members().len(), MAX_BANNED_MEMBERS);
        assert!(!m.is_banned(&member(0)));
        assert!(m.is_banned(&member(1)));
        assert!(m.is_banned(&member(9_999)));
    }

    #[test]
    fn test_ban_eviction_tiebreak_by_member_id() {
        let mut m = GroupMembership::new();
        // All bans at the same timestamp; the lowest member id goes first.
        for i in 0..MAX_BANNED_MEMBERS {
            m.ban(member(i as u128 + 10), 777);
        }
        m.ban(member(5), 777);
        assert!(!m.is_banned(&member(5)));
        // An over-capacity insert with a newer timestamp evicts id 10 (oldest
        // tie, lowest id).
        m.ban(member(5_000), 778);
        assert!(!m.is_banned(&member(10)));
        assert!(m.is_banned(&member(5_000)));
    }

    #[test]
    fn test_last_administrator() {
        let mut m = GroupMembership::new();
        let a = member(1);
        let b = member(2);
        m.add_full_member(a, full(Role::Administrator));
        m.add_full_member(b, full(Role::Normal));
        assert!(m.is_last_administrator(&a));
        assert!(!m.is_last_administrator(&b));

        m.add_full_member(b, full(Role::Administrator));
        assert!(!m.is_last_administrator(&a));
    }

    #[test]
    fn test_access_level_satisfaction() {
        assert!(AccessLevel::Any.satisfied_by(None));
        assert!(AccessLevel::Member.satisfied_by(Some(Role::Normal)));
        assert!(!AccessLevel::Member.satisfied_by(None));
        assert!(AccessLevel::Administrator.satisfied_by(Some(Role::Administrator)));
        assert!(!AccessLevel::Administrator.satisfied_by(Some(Role::Normal)));
        assert!(!AccessLevel::Unsatisfiable.satisfied_by(Some(Role::Administrator)));
        assert!(!AccessLevel::Unknown.satisfied_by(Some(Role::Administrator)));
    }

    #[test]
    fn test_placeholder_state() {
        let me = member(42);
        let s = GroupState::placeholder(7, me);
        assert!(s.placeholder);
        assert_eq!(s.revision, 7);
        assert!(s.membership.is_requesting(&me));
        assert!(!s.membership.is_full_member(&me));
    }

    #[test]
    fn test_equal_states_serialize_identically() {
        let mut a = GroupState::empty();
        a.membership.add_full_member(member(3), full(Role::Normal));
        a.membership.add_full_member(member(1), full(Role::Administrator));

        let mut b = GroupState::empty();
        // Insert in the opposite order; BTreeMap canonicalizes.
        b.membership.add_full_member(member(1), full(Role::Administrator));
        b.membership.add_full_member(member(3), full(Role::Normal));

        let bytes_a = bincode::serialize(&a).unwrap();
        let bytes_b = bincode::serialize(&b).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }
}
