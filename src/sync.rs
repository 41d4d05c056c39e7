/// Refresh orchestration: bring the local replica up to the service's
/// current revision, and push locally-built changes out.
///
/// Refreshes run in one of two serialized lanes. The immediate lane serves
/// user-visible needs (opening the group, submitting a change) as well as
/// throttled background polls. The deferred lane waits for the per-group
/// message backlog to drain first, so changes that arrive embedded in
/// messages get applied the cheap way before we go to the network.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::actions::ChangeActionSet;
use crate::apply::{ApplyError, ChangeApplicator};
use crate::builder::{BuildError, ChangeIntent, LocalIdentity, OutgoingChangeBuilder, PendingChange};
use crate::cache::ChangePageCache;
use crate::cipher::GroupCipher;
use crate::ids::{GroupId, MemberId};
use crate::limits::{FETCH_ATTEMPTS, FETCH_TIMEOUT, REFRESH_THROTTLE};
use crate::state::GroupState;
use crate::store::{CredentialSource, GroupStore, ProfileKeyStore, StoreError};
use crate::transport::{GroupTransport, TransportError};
use crate::wire::{ChangePage, GroupJoinInfo};

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network-level failure; retrying later may succeed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Lost a submission race and could not reconcile within the attempt
    /// budget, or the intent no longer makes sense against the new state.
    #[error("conflicting concurrent change")]
    Conflict,

    /// The requested change is already reflected in the group.
    #[error("change is already applied")]
    Redundant,

    #[error("not authorized for this group")]
    Unauthorized,

    #[error("malformed data from the service: {0}")]
    Malformed(String),

    #[error("service resource limit exceeded")]
    ResourceLimit,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => SyncError::Transient(msg),
            TransportError::Timeout => SyncError::Transient("timed out".into()),
            TransportError::Conflict => SyncError::Conflict,
            TransportError::Unauthorized | TransportError::NotFound => SyncError::Unauthorized,
            TransportError::NoChangeLog => SyncError::Malformed("change log unavailable".into()),
            TransportError::ResourceLimit => SyncError::ResourceLimit,
            TransportError::Malformed(msg) => SyncError::Malformed(msg),
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(err: ApplyError) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Refresh modes & outcomes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshMode {
    /// User is waiting; runs now, ignores the throttle.
    Immediate,
    /// Ordered behind the message backlog, so a fetch never races ahead of
    /// changes already sitting in the inbound queue.
    Deferred,
    /// Opportunistic poll; skipped when the group was refreshed recently.
    Background,
}

impl RefreshMode {
    /// The durable refreshed-to-revision marker tracks deliberate, full
    /// refreshes; background polls do not write it.
    fn records_durable_marker(self) -> bool {
        !matches!(self, RefreshMode::Background)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { from: u32, to: u32 },
    AlreadyCurrent,
    /// Refreshed too recently; nothing was fetched.
    Throttled,
    /// An equivalent refresh is already running; this one was dropped, not
    /// queued.
    AlreadyInFlight,
}

/// Result of a successful submission.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitOutcome {
    /// The set as the service committed it.
    pub committed: ChangeActionSet,
    pub silent: bool,
}

// ---------------------------------------------------------------------------
// Message backlog barrier
// ---------------------------------------------------------------------------

/// Deferred refreshes wait for pending inbound messages of a group to be
/// processed before fetching, since those messages often carry the very
/// changes a fetch would return.
#[async_trait]
pub trait MessageBacklog: Send + Sync {
    async fn wait_until_drained(&self, group: &GroupId);
}

/// Barrier for callers with no message pipeline.
pub struct NoBacklog;

#[async_trait]
impl MessageBacklog for NoBacklog {
    async fn wait_until_drained(&self, _group: &GroupId) {}
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    transport: Arc<dyn GroupTransport>,
    store: Arc<dyn GroupStore>,
    profile_keys: Arc<dyn ProfileKeyStore>,
    cipher: Arc<dyn GroupCipher>,
    backlog: Arc<dyn MessageBacklog>,
    local_member: MemberId,
    pages: ChangePageCache,
    inflight: Mutex<HashSet<(GroupId, RefreshMode)>>,
    last_refresh: Mutex<HashMap<GroupId, Instant>>,
    immediate_lane: tokio::sync::Mutex<()>,
    deferred_lane: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        store: Arc<dyn GroupStore>,
        profile_keys: Arc<dyn ProfileKeyStore>,
        cipher: Arc<dyn GroupCipher>,
        backlog: Arc<dyn MessageBacklog>,
        local_member: MemberId,
    ) -> Self {
        SyncOrchestrator {
            transport,
            store,
            profile_keys,
            cipher,
            backlog,
            local_member,
            pages: ChangePageCache::default(),
            inflight: Mutex::new(HashSet::new()),
            last_refresh: Mutex::new(HashMap::new()),
            immediate_lane: tokio::sync::Mutex::new(()),
            deferred_lane: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring `group` up to the current service revision.
    pub async fn refresh(
        &self,
        group: &GroupId,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome, SyncError> {
        if !self.inflight.lock().unwrap().insert((*group, mode)) {
            debug!("refresh of {} already in flight, dropping", group);
            return Ok(RefreshOutcome::AlreadyInFlight);
        }
        let result = self.refresh_inner(group, mode).await;
        self.inflight.lock().unwrap().remove(&(*group, mode));
        result
    }

    async fn refresh_inner(
        &self,
        group: &GroupId,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome, SyncError> {
        let _lane = match mode {
            RefreshMode::Immediate | RefreshMode::Background => {
                self.immediate_lane.lock().await
            }
            RefreshMode::Deferred => self.deferred_lane.lock().await,
        };

        if mode == RefreshMode::Background {
            if let Some(at) = self.last_refresh.lock().unwrap().get(group) {
                if at.elapsed() < REFRESH_THROTTLE {
                    debug!("refresh of {} throttled", group);
                    return Ok(RefreshOutcome::Throttled);
                }
            }
        }
        if mode == RefreshMode::Deferred {
            self.backlog.wait_until_drained(group).await;
        }

        let outcome = self.catch_up(group, mode.records_durable_marker()).await?;
        self.last_refresh.lock().unwrap().insert(*group, Instant::now());
        Ok(outcome)
    }

    /// Pre-join summary for an invite link.
    pub async fn fetch_join_info(&self, group: &GroupId) -> Result<GroupJoinInfo, SyncError> {
        self.with_retries(|| self.transport.fetch_join_info(group))
            .await
            .map_err(SyncError::from)
    }

    /// Build `intent` against the freshest local state and push it to the
    /// service, reconciling and rebuilding on revision conflicts.
    pub async fn submit(
        &self,
        group: &GroupId,
        identity: &LocalIdentity,
        credentials: &dyn CredentialSource,
        intent: &ChangeIntent,
        now_ms: u64,
    ) -> Result<SubmitOutcome, SyncError> {
        let builder = OutgoingChangeBuilder::new(self.cipher.as_ref(), identity, credentials);

        for attempt in 1..=FETCH_ATTEMPTS {
            let state = match self.store.load(group).await? {
                Some(state) if !state.placeholder => state,
                _ => {
                    self.catch_up(group, true).await?;
                    self.store
                        .load(group)
                        .await?
                        .ok_or_else(|| SyncError::Malformed("group missing after sync".into()))?
                }
            };

            let PendingChange { set, silent } = match builder.build(&state, intent, now_ms) {
                Ok(pending) => pending,
                Err(BuildError::Redundant) => return Err(SyncError::Redundant),
                Err(BuildError::Conflicting(reason)) => {
                    debug!("intent no longer applies: {}", reason);
                    return Err(SyncError::Conflict);
                }
                Err(BuildError::PlaceholderState) => return Err(SyncError::Conflict),
                Err(BuildError::MissingCredential) => {
                    return Err(SyncError::Transient(
                        "local profile key credential missing".into(),
                    ))
                }
                Err(err) => return Err(SyncError::Malformed(err.to_string())),
            };

            let committed = match self
                .with_retries(|| self.transport.submit_change(group, set.clone()))
                .await
            {
                Ok(committed) => committed,
                Err(TransportError::Conflict) => {
                    info!(
                        "submission for {} lost the race (attempt {}), reconciling",
                        group, attempt
                    );
                    self.catch_up(group, true).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            self.apply_and_persist(group, &state, &committed).await?;
            return Ok(SubmitOutcome { committed, silent });
        }

        Err(SyncError::Conflict)
    }

    // -- catch-up ------------------------------------------------------------

    async fn catch_up(&self, group: &GroupId, durable: bool) -> Result<RefreshOutcome, SyncError> {
        let local = self.store.load(group).await?;

        let mut state = match local {
            None => return self.bootstrap_from_snapshot(group, durable).await,
            Some(state) if state.placeholder => {
                return self.catch_up_placeholder(group, state, durable).await
            }
            Some(state) => state,
        };
        let from = state.revision;
        let mut last_author = None;

        loop {
            let next_from = state.revision + 1;
            let page = match self.fetch_page(group, next_from, state.revision, false).await {
                Ok(page) => page,
                // The log does not reach back to our revision; only a
                // snapshot can catch us up.
                Err(TransportError::NoChangeLog) => {
                    info!("no change log for {}, falling back to snapshot", group);
                    return self.bootstrap_from_snapshot(group, durable).await;
                }
                // An unparseable response is terminal, never papered over
                // with a snapshot.
                Err(TransportError::Malformed(msg)) => {
                    error!("unparseable change log response for {}: {}", group, msg);
                    return Err(SyncError::Malformed(msg));
                }
                Err(err) => return Err(err.into()),
            };

            if page.entries.is_empty() {
                break;
            }

            last_author = self.apply_page(group, &mut state, &page).await?.or(last_author);

            match page.partial {
                Some(last) => {
                    debug!("partial page for {} through revision {}", group, last);
                }
                None => break,
            }
        }

        self.persist(group, &state, last_author).await?;
        if durable {
            self.store.mark_refreshed(group, state.revision).await?;
        }

        if state.revision == from {
            Ok(RefreshOutcome::AlreadyCurrent)
        } else {
            info!("{} advanced from revision {} to {}", group, from, state.revision);
            Ok(RefreshOutcome::Updated {
                from,
                to: state.revision,
            })
        }
    }

    /// A placeholder can only become real through a snapshot: ask the log to
    /// attach one to the first entry, and fall back to a direct snapshot
    /// fetch when it does not.
    async fn catch_up_placeholder(
        &self,
        group: &GroupId,
        placeholder: GroupState,
        durable: bool,
    ) -> Result<RefreshOutcome, SyncError> {
        let page = match self
            .fetch_page(group, placeholder.revision, placeholder.revision, true)
            .await
        {
            Ok(page) => page,
            // The log is closed to us until we are a member; the snapshot
            // endpoint honors the invite-link credential.
            Err(TransportError::NoChangeLog)
            | Err(TransportError::Unauthorized)
            | Err(TransportError::NotFound) => {
                return self.bootstrap_from_snapshot(group, durable).await
            }
            Err(TransportError::Malformed(msg)) => {
                error!("unparseable change log response for {}: {}", group, msg);
                return Err(SyncError::Malformed(msg));
            }
            Err(err) => return Err(err.into()),
        };

        let snapshot = page.entries.first().and_then(|e| e.snapshot.as_ref());
        let mut state = match snapshot {
            Some(snapshot) => {
                let applicator = ChangeApplicator::new(self.cipher.as_ref(), self.local_member);
                let decrypted = applicator.state_from_snapshot(snapshot)?;
                self.profile_keys
                    .merge_profile_keys(&decrypted.profile_keys)
                    .await?;
                decrypted.state
            }
            None => {
                debug!("no snapshot attached for placeholder {}", group);
                return self.bootstrap_from_snapshot(group, durable).await;
            }
        };

        let last_author = self.apply_page(group, &mut state, &page).await?;
        self.persist(group, &state, last_author).await?;
        if durable {
            self.store.mark_refreshed(group, state.revision).await?;
        }

        Ok(RefreshOutcome::Updated {
            from: placeholder.revision,
            to: state.revision,
        })
    }

    async fn bootstrap_from_snapshot(
        &self,
        group: &GroupId,
        durable: bool,
    ) -> Result<RefreshOutcome, SyncError> {
        let snapshot = self
            .with_retries(|| self.transport.fetch_snapshot(group))
            .await?;
        let applicator = ChangeApplicator::new(self.cipher.as_ref(), self.local_member);
        let decrypted = applicator.state_from_snapshot(&snapshot)?;

        let from = decrypted.state.revision;
        self.profile_keys
            .merge_profile_keys(&decrypted.profile_keys)
            .await?;
        self.persist(group, &decrypted.state, None).await?;
        if durable {
            self.store.mark_refreshed(group, from).await?;
        }

        info!("bootstrapped {} from snapshot at revision {}", group, from);
        Ok(RefreshOutcome::Updated { from, to: from })
    }

    /// Apply every entry of `page` on top of `state`. Returns the author of
    /// the last applied change, for update attribution.
    async fn apply_page(
        &self,
        group: &GroupId,
        state: &mut GroupState,
        page: &ChangePage,
    ) -> Result<Option<MemberId>, SyncError> {
        let applicator = ChangeApplicator::new(self.cipher.as_ref(), self.local_member);
        let mut last_author = None;

        for entry in &page.entries {
            let set = match &entry.change {
                Some(set) => set,
                None => continue,
            };
            // Older entries were applied on an earlier pass; the current
            // revision still goes to `apply`, which cross-checks the
            // re-delivered set against the state instead of dropping it.
            if set.revision < state.revision {
                continue;
            }

            match applicator.apply(state, set) {
                Ok(outcome) => {
                    self.profile_keys
                        .merge_profile_keys(&outcome.profile_keys)
                        .await?;
                    last_author = Some(outcome.author);
                    *state = outcome.state;
                }
                // A hole in the log; the attached snapshot (when present)
                // jumps over it.
                Err(ApplyError::RevisionMismatch { .. }) => match &entry.snapshot {
                    Some(snapshot) => {
                        warn!("revision gap in change log for {}, using snapshot", group);
                        let decrypted = applicator.state_from_snapshot(snapshot)?;
                        self.profile_keys
                            .merge_profile_keys(&decrypted.profile_keys)
                            .await?;
                        last_author = None;
                        *state = decrypted.state;
                    }
                    None => {
                        return Err(SyncError::Malformed(format!(
                            "change log jumps from {} to {}",
                            state.revision, set.revision
                        )))
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }

        Ok(last_author)
    }

    async fn apply_and_persist(
        &self,
        group: &GroupId,
        state: &GroupState,
        committed: &ChangeActionSet,
    ) -> Result<(), SyncError> {
        let applicator = ChangeApplicator::new(self.cipher.as_ref(), self.local_member);
        match applicator.apply(state, committed) {
            Ok(outcome) => {
                self.profile_keys
                    .merge_profile_keys(&outcome.profile_keys)
                    .await?;
                self.persist(group, &outcome.state, Some(outcome.author)).await?;
                self.store.mark_refreshed(group, outcome.state.revision).await?;
                Ok(())
            }
            // Local state moved underneath us; a full catch-up will pick the
            // committed set up from the log.
            Err(ApplyError::RevisionMismatch { .. }) => {
                self.catch_up(group, true).await.map(|_| ())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(
        &self,
        group: &GroupId,
        state: &GroupState,
        author: Option<MemberId>,
    ) -> Result<(), SyncError> {
        self.store.save(group, state, author).await?;
        self.pages.invalidate_through(group, state.revision);
        Ok(())
    }

    // -- fetching ------------------------------------------------------------

    async fn fetch_page(
        &self,
        group: &GroupId,
        from_revision: u32,
        local_revision: u32,
        include_first_state: bool,
    ) -> Result<ChangePage, TransportError> {
        if !include_first_state {
            if let Some(page) = self.pages.get(group, from_revision, local_revision) {
                debug!("change page for {} from {} served from cache", group, from_revision);
                return Ok(page);
            }
        }

        let page = self
            .with_retries(|| {
                self.transport
                    .fetch_change_log(group, from_revision, include_first_state)
            })
            .await?;

        if !include_first_state {
            self.pages.put(group, from_revision, page.clone());
        }
        Ok(page)
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let mut last = TransportError::Timeout;
        for attempt in 1..=FETCH_ATTEMPTS {
            let result = match tokio::time::timeout(FETCH_TIMEOUT, op()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    warn!("request failed (attempt {}): {}", attempt, err);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
