//! Shared test fixtures: a deterministic cipher, an in-memory store and a
//! scriptable transport.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::actions::ChangeActionSet;
use crate::cipher::{CipherError, GroupCipher};
use crate::ids::{
    GroupId, LegacyGroupId, MemberId, OpaqueUserId, ProfileKey, ProfileKeyCiphertext,
    ProfileKeyCredential,
};
use crate::state::{FullMember, GroupState, Role};
use crate::store::{CredentialSource, GroupStore, ProfileKeyStore, StoreError};
use crate::transport::{GroupTransport, TransportError};
use crate::wire::{
    ChangePage, EncryptedGroupSnapshot, EncryptedMember, EncryptedPendingMember, GroupJoinInfo,
};

// ---------------------------------------------------------------------------
// Deterministic ids and keys
// ---------------------------------------------------------------------------

pub fn member_id(tag: u8) -> MemberId {
    MemberId::new(Uuid::from_bytes([tag; 16]))
}

pub fn profile_key(tag: u8) -> ProfileKey {
    ProfileKey::from_bytes([tag; 32])
}

pub fn group_id(tag: u8) -> GroupId {
    GroupId::from_bytes([tag; 32])
}

pub fn enc_uid(cipher: &TestCipher, member: MemberId) -> OpaqueUserId {
    cipher.encrypt_identifier(&member).unwrap()
}

/// Ciphertext of the member's canonical test profile key (derived from the
/// first byte of their uuid).
pub fn enc_key(cipher: &TestCipher, member: MemberId) -> ProfileKeyCiphertext {
    let key = profile_key(member.as_uuid().as_bytes()[0]);
    cipher.encrypt_profile_key(&key, &member).unwrap()
}

/// State at `revision` with `admin` as the sole (administrator) member.
pub fn admin_state(_cipher: &TestCipher, admin: MemberId, revision: u32) -> GroupState {
    let mut state = GroupState::empty();
    state.revision = revision;
    state.membership.add_full_member(
        admin,
        FullMember {
            role: Role::Administrator,
            joined_at_revision: 0,
        },
    );
    state
}

/// Encrypted snapshot at `revision` with the given full and invited members.
/// Invited entries are `(invitee, added_by)`.
pub fn snapshot_with(
    cipher: &TestCipher,
    revision: u32,
    members: &[(MemberId, Role)],
    invited: &[(MemberId, MemberId)],
) -> EncryptedGroupSnapshot {
    EncryptedGroupSnapshot {
        revision,
        title_blob: None,
        description_blob: None,
        avatar: None,
        timer_blob: None,
        access: Default::default(),
        invite_link_password: None,
        announcements_only: false,
        members: members
            .iter()
            .map(|(id, role)| EncryptedMember {
                user_id: enc_uid(cipher, *id),
                role: *role,
                profile_key: enc_key(cipher, *id),
                joined_at_revision: 0,
            })
            .collect(),
        pending_members: invited
            .iter()
            .map(|(invitee, added_by)| EncryptedPendingMember {
                user_id: enc_uid(cipher, *invitee),
                role: Role::Normal,
                added_by: enc_uid(cipher, *added_by),
                timestamp_ms: 0,
            })
            .collect(),
        requesting_members: Vec::new(),
        banned_members: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// TestCipher
// ---------------------------------------------------------------------------

/// Reversible tag-prefix "encryption". Anything without the right tag fails
/// to decrypt, which is how tests produce unreadable invites.
pub struct TestCipher;

impl TestCipher {
    pub fn new() -> Self {
        TestCipher
    }
}

impl GroupCipher for TestCipher {
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut out = b"B!".to_vec();
        out.extend_from_slice(plaintext);
        Ok(out)
    }

    fn decrypt_blob(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        ciphertext
            .strip_prefix(b"B!")
            .map(|rest| rest.to_vec())
            .ok_or_else(|| CipherError::BlobDecrypt("bad tag".into()))
    }

    fn encrypt_identifier(&self, member: &MemberId) -> Result<OpaqueUserId, CipherError> {
        let mut out = b"U!".to_vec();
        out.extend_from_slice(member.as_uuid().as_bytes());
        Ok(OpaqueUserId::from_bytes(out))
    }

    fn decrypt_identifier(&self, user_id: &OpaqueUserId) -> Result<MemberId, CipherError> {
        let rest = user_id
            .as_bytes()
            .strip_prefix(b"U!")
            .ok_or(CipherError::IdentifierDecrypt)?;
        let bytes: [u8; 16] = rest.try_into().map_err(|_| CipherError::IdentifierDecrypt)?;
        Ok(MemberId::new(Uuid::from_bytes(bytes)))
    }

    fn encrypt_profile_key(
        &self,
        key: &ProfileKey,
        member: &MemberId,
    ) -> Result<ProfileKeyCiphertext, CipherError> {
        let mut out = b"P!".to_vec();
        out.extend_from_slice(member.as_uuid().as_bytes());
        out.extend_from_slice(key.as_bytes());
        Ok(ProfileKeyCiphertext::from_bytes(out))
    }

    fn decrypt_profile_key(
        &self,
        ciphertext: &ProfileKeyCiphertext,
        member: &MemberId,
    ) -> Result<ProfileKey, CipherError> {
        let rest = ciphertext
            .as_bytes()
            .strip_prefix(b"P!")
            .ok_or(CipherError::ProfileKeyDecrypt)?;
        if rest.len() != 48 || &rest[..16] != member.as_uuid().as_bytes() {
            return Err(CipherError::ProfileKeyDecrypt);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&rest[16..]);
        Ok(ProfileKey::from_bytes(key))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory implementation of every persistence seam.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<GroupId, GroupState>>,
    authors: Mutex<HashMap<GroupId, MemberId>>,
    refreshed: Mutex<HashMap<GroupId, u32>>,
    keys: Mutex<BTreeMap<MemberId, ProfileKey>>,
    credentials: Mutex<HashMap<MemberId, ProfileKeyCredential>>,
    legacy: Mutex<HashSet<LegacyGroupId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_state(&self, group: GroupId, state: GroupState) {
        self.states.lock().unwrap().insert(group, state);
    }

    pub fn state(&self, group: &GroupId) -> Option<GroupState> {
        self.states.lock().unwrap().get(group).cloned()
    }

    pub fn put_credential(&self, member: MemberId, key: ProfileKey) {
        self.credentials
            .lock()
            .unwrap()
            .insert(member, ProfileKeyCredential(key));
    }

    pub fn put_legacy(&self, id: LegacyGroupId) {
        self.legacy.lock().unwrap().insert(id);
    }

    pub fn has_legacy(&self, id: &LegacyGroupId) -> bool {
        self.legacy.lock().unwrap().contains(id)
    }

    pub fn merged_keys(&self) -> BTreeMap<MemberId, ProfileKey> {
        self.keys.lock().unwrap().clone()
    }

    pub fn saved_author(&self, group: &GroupId) -> Option<MemberId> {
        self.authors.lock().unwrap().get(group).copied()
    }

    pub fn refreshed(&self, group: &GroupId) -> Option<u32> {
        self.refreshed.lock().unwrap().get(group).copied()
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn load(&self, group: &GroupId) -> Result<Option<GroupState>, StoreError> {
        Ok(self.state(group))
    }

    async fn save(
        &self,
        group: &GroupId,
        state: &GroupState,
        author: Option<MemberId>,
    ) -> Result<(), StoreError> {
        if let Some(author) = author {
            self.authors.lock().unwrap().insert(*group, author);
        }
        self.put_state(*group, state.clone());
        Ok(())
    }

    async fn replace_legacy(
        &self,
        legacy: &LegacyGroupId,
        group: &GroupId,
        state: &GroupState,
    ) -> Result<(), StoreError> {
        self.legacy.lock().unwrap().remove(legacy);
        self.put_state(*group, state.clone());
        Ok(())
    }

    async fn mark_refreshed(&self, group: &GroupId, revision: u32) -> Result<(), StoreError> {
        self.refreshed.lock().unwrap().insert(*group, revision);
        Ok(())
    }

    async fn refreshed_revision(&self, group: &GroupId) -> Result<Option<u32>, StoreError> {
        Ok(self.refreshed(group))
    }
}

#[async_trait]
impl ProfileKeyStore for MemoryStore {
    async fn merge_profile_keys(
        &self,
        keys: &BTreeMap<MemberId, ProfileKey>,
    ) -> Result<(), StoreError> {
        self.keys.lock().unwrap().extend(keys.clone());
        Ok(())
    }
}

impl CredentialSource for MemoryStore {
    fn credential(&self, member: &MemberId) -> Option<ProfileKeyCredential> {
        self.credentials.lock().unwrap().get(member).cloned()
    }
}

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// Transport fed from per-endpoint response queues, recording every call.
/// Empty queues fall back to benign defaults: an empty change page, a
/// successful (echoing) submit, a successful create, `NotFound` for
/// snapshots and join info.
#[derive(Default)]
pub struct ScriptedTransport {
    pages: Mutex<VecDeque<Result<ChangePage, TransportError>>>,
    snapshots: Mutex<VecDeque<Result<EncryptedGroupSnapshot, TransportError>>>,
    join_infos: Mutex<VecDeque<Result<GroupJoinInfo, TransportError>>>,
    submit_results: Mutex<VecDeque<Result<(), TransportError>>>,
    create_results: Mutex<VecDeque<Result<(), TransportError>>>,
    delay: Mutex<Option<Duration>>,

    log_requests: Mutex<Vec<(GroupId, u32, bool)>>,
    snapshot_requests: Mutex<Vec<GroupId>>,
    submitted: Mutex<Vec<ChangeActionSet>>,
    created: Mutex<Vec<(GroupId, EncryptedGroupSnapshot)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: Result<ChangePage, TransportError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn push_snapshot(&self, snapshot: Result<EncryptedGroupSnapshot, TransportError>) {
        self.snapshots.lock().unwrap().push_back(snapshot);
    }

    pub fn push_join_info(&self, info: Result<GroupJoinInfo, TransportError>) {
        self.join_infos.lock().unwrap().push_back(info);
    }

    pub fn push_submit_result(&self, result: Result<(), TransportError>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    pub fn push_create_result(&self, result: Result<(), TransportError>) {
        self.create_results.lock().unwrap().push_back(result);
    }

    /// Delay every change-log fetch, for overlap tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn log_requests(&self) -> Vec<(GroupId, u32, bool)> {
        self.log_requests.lock().unwrap().clone()
    }

    pub fn snapshot_requests(&self) -> Vec<GroupId> {
        self.snapshot_requests.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<ChangeActionSet> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn created_groups(&self) -> Vec<(GroupId, EncryptedGroupSnapshot)> {
        self.created.lock().unwrap().clone()
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GroupTransport for ScriptedTransport {
    async fn fetch_change_log(
        &self,
        group: &GroupId,
        from_revision: u32,
        include_first_state: bool,
    ) -> Result<ChangePage, TransportError> {
        self.log_requests
            .lock()
            .unwrap()
            .push((*group, from_revision, include_first_state));
        self.maybe_delay().await;
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChangePage::default()))
    }

    async fn fetch_snapshot(
        &self,
        group: &GroupId,
    ) -> Result<EncryptedGroupSnapshot, TransportError> {
        self.snapshot_requests.lock().unwrap().push(*group);
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::NotFound))
    }

    async fn fetch_join_info(&self, group: &GroupId) -> Result<GroupJoinInfo, TransportError> {
        let _ = group;
        self.join_infos
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::NotFound))
    }

    async fn submit_change(
        &self,
        _group: &GroupId,
        set: ChangeActionSet,
    ) -> Result<ChangeActionSet, TransportError> {
        self.submitted.lock().unwrap().push(set.clone());
        match self.submit_results.lock().unwrap().pop_front() {
            Some(Ok(())) | None => Ok(set),
            Some(Err(err)) => Err(err),
        }
    }

    async fn create_group(
        &self,
        group: &GroupId,
        snapshot: EncryptedGroupSnapshot,
    ) -> Result<(), TransportError> {
        let result = self
            .create_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.created.lock().unwrap().push((*group, snapshot));
        }
        result
    }
}
