//! One sync cycle of one subscription: fetch, parse, merge.
//!
//! A cycle either commits its merge together with the subscription's success
//! mark, or changes nothing but `last_fetch_status`/`last_fetch_error`. An
//! unchanged list (`304`) is merged again from the stored claim set, since
//! priorities, flags or records may have changed since the last fetch.
//! Cycles whose subscription disappears, or whose worker is stopped, leave no
//! trace at all.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::MutexGuard as AsyncMutexGuard;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use permsync_net::{BasicAuth, FetchError, FetchOutcome, FetchRequest, FetchedList};
use permsync_shared::crypto::CredentialCipher;
use permsync_shared::{parse_list, ParsedEntry, PermissionType, SubscriptionId};
use permsync_store::{Database, ListValidators, PermissionStore, Subscription, SyncMark};

use crate::error::CycleError;
use crate::locks::MergeLocks;
use crate::merge::{merge_entries, remove_subscription, MergeReport, RemovalReport};
use crate::source::ListSource;

/// The store handle shared between the engine and the admin API.
pub type SharedDb = Arc<Mutex<Database>>;

/// Phase a subscription's worker is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Fetching,
    Parsing,
    Merging,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The remote answered 304; the stored claim set was merged again.
    NotModified(MergeReport),
    Merged(MergeReport),
}

pub struct SyncEngine {
    db: SharedDb,
    source: Arc<dyn ListSource>,
    cipher: CredentialCipher,
    locks: MergeLocks,
}

impl SyncEngine {
    pub fn new(db: SharedDb, source: Arc<dyn ListSource>, cipher: CredentialCipher) -> Self {
        Self {
            db,
            source,
            cipher,
            locks: MergeLocks::new(),
        }
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    /// Run one cycle for `id`, publishing its phase on `state`.
    ///
    /// Failures other than discards are recorded on the subscription before
    /// being returned.
    pub async fn run_cycle(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
        state: &watch::Sender<CycleState>,
    ) -> Result<CycleOutcome, CycleError> {
        let result = self.run_phases(id, cancel, state).await;
        state.send_replace(CycleState::Idle);

        match &result {
            Ok(CycleOutcome::Merged(report)) => info!(
                subscription = %id,
                created = report.created,
                updated = report.refreshed + report.adopted + report.taken_over,
                handed_over = report.handed_over,
                deleted = report.deleted,
                "Sync cycle merged"
            ),
            Ok(CycleOutcome::NotModified(report)) => info!(
                subscription = %id,
                mutations = report.mutations(),
                "List not modified, stored claims merged"
            ),
            Err(e) if e.is_discard() => debug!(subscription = %id, reason = %e, "Sync cycle discarded"),
            Err(e) => {
                warn!(subscription = %id, error = %e, "Sync cycle failed");
                if let Err(record_err) = self.record_failure(id, e) {
                    error!(subscription = %id, error = %record_err, "Failed to record sync failure");
                }
            }
        }

        result
    }

    async fn run_phases(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
        state: &watch::Sender<CycleState>,
    ) -> Result<CycleOutcome, CycleError> {
        let sub = self.load(id)?;
        let req = self.fetch_request(&sub)?;

        state.send_replace(CycleState::Fetching);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            res = self.source.fetch(&req) => res?,
        };
        let list = match fetched {
            FetchOutcome::Fetched(list) => list,
            FetchOutcome::NotModified => {
                state.send_replace(CycleState::Merging);
                let _merge_guard = self.merge_lock(sub.permission_type, cancel).await?;
                let report = self.remerge(id)?;
                return Ok(CycleOutcome::NotModified(report));
            }
        };

        state.send_replace(CycleState::Parsing);
        let entries = parse_list(sub.content_type, &list.body)?;
        debug!(subscription = %id, entries = entries.len(), "Parsed list");

        state.send_replace(CycleState::Merging);
        let _merge_guard = self.merge_lock(sub.permission_type, cancel).await?;
        let report = self.commit(id, &entries, &list)?;

        Ok(CycleOutcome::Merged(report))
    }

    async fn merge_lock(
        &self,
        permission_type: PermissionType,
        cancel: &CancellationToken,
    ) -> Result<AsyncMutexGuard<'_, ()>, CycleError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CycleError::Cancelled),
            guard = self.locks.acquire(permission_type) => Ok(guard),
        }
    }

    /// Fetch and parse `id`'s list without merging it. Validators are not
    /// sent, so the full list is always returned.
    pub async fn preview(&self, id: SubscriptionId) -> Result<Vec<ParsedEntry>, CycleError> {
        let sub = self.load(id)?;
        let req = FetchRequest {
            etag: None,
            last_modified: None,
            ..self.fetch_request(&sub)?
        };

        match self.source.fetch(&req).await? {
            FetchOutcome::Fetched(list) => Ok(parse_list(sub.content_type, &list.body)?),
            FetchOutcome::NotModified => Err(FetchError::Status(304).into()),
        }
    }

    /// Delete subscription `id`, handing its records to other claimants and
    /// deleting or orphaning the rest. Waits for any merge of the same type.
    pub async fn remove(
        &self,
        id: SubscriptionId,
        remove_children: bool,
    ) -> Result<RemovalReport, CycleError> {
        let sub = self.load(id)?;
        let _merge_guard = self.locks.acquire(sub.permission_type).await;
        self.remove_locked(id, remove_children)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Database>, CycleError> {
        self.db.lock().map_err(|_| CycleError::Poisoned)
    }

    fn load(&self, id: SubscriptionId) -> Result<Subscription, CycleError> {
        self.lock_db()?
            .conn()
            .get_subscription(id)?
            .ok_or(CycleError::SubscriptionGone(id))
    }

    fn fetch_request(&self, sub: &Subscription) -> Result<FetchRequest, CycleError> {
        let password = sub
            .fetch_password
            .as_ref()
            .map(|sealed| self.cipher.open(sealed))
            .transpose()?;

        Ok(FetchRequest {
            uri: sub.uri.clone(),
            auth: BasicAuth::from_pair(sub.fetch_username.as_deref(), password.as_deref()),
            etag: sub.etag.clone(),
            last_modified: sub.last_modified.clone(),
        })
    }

    /// Merge the claim set stored by the last successful parse. Validators
    /// and `entry_count` are left as they are.
    fn remerge(&self, id: SubscriptionId) -> Result<MergeReport, CycleError> {
        let now = Utc::now();
        let mark = SyncMark {
            at: now,
            refreshed: None,
        };

        let mut db = self.lock_db()?;
        db.transaction(|conn| {
            let claims = conn.list_claims(id)?;
            let report = merge_entries(conn, id, &claims, now)?;
            conn.record_sync_success(id, &mark)?;
            Ok::<_, CycleError>(report)
        })
    }

    fn commit(
        &self,
        id: SubscriptionId,
        entries: &[ParsedEntry],
        list: &FetchedList,
    ) -> Result<MergeReport, CycleError> {
        let now = Utc::now();
        let mark = SyncMark {
            at: now,
            refreshed: Some(ListValidators {
                entry_count: entries.len() as i64,
                etag: list.etag.clone(),
                last_modified: list.last_modified.clone(),
            }),
        };

        let mut db = self.lock_db()?;
        db.transaction(|conn| {
            let report = merge_entries(conn, id, entries, now)?;
            conn.record_sync_success(id, &mark)?;
            Ok::<_, CycleError>(report)
        })
    }

    fn remove_locked(
        &self,
        id: SubscriptionId,
        remove_children: bool,
    ) -> Result<RemovalReport, CycleError> {
        let mut db = self.lock_db()?;
        let report =
            db.transaction(|conn| remove_subscription(conn, id, remove_children, Utc::now()))?;
        info!(
            subscription = %id,
            handed_over = report.handed_over,
            deleted = report.deleted,
            orphaned = report.orphaned,
            "Subscription removed"
        );
        Ok(report)
    }

    fn record_failure(&self, id: SubscriptionId, failure: &CycleError) -> Result<(), CycleError> {
        self.lock_db()?
            .record_fetch_error(id, &failure.to_string(), Utc::now())?;
        Ok(())
    }
}
