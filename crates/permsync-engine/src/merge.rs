//! Reconciling a parsed list with the permission store.
//!
//! For one subscription and one parsed list, [`merge_entries`] decides per
//! domain whether to create, refresh, adopt, take over, hand over or release
//! a permission record. Ownership between subscriptions claiming the same
//! domain is settled by [`Rank`](permsync_store::Rank): higher priority first, then the older id.
//!
//! Every write is conditional on the owner observed when the decision was
//! made. Callers run the merge inside one store transaction, so a conflict on
//! any write rolls the whole merge back.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use permsync_shared::{ParsedEntry, PermissionState, PermissionType, SubscriptionId};
use permsync_store::{
    Claim, DeleteOutcome, DomainPermission, PermissionStore, Precondition, WriteOutcome,
};

use crate::error::MergeError;

/// Tally of what a merge did. Records counted in `unchanged` and `skipped`
/// were not written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub created: usize,
    pub refreshed: usize,
    pub adopted: usize,
    pub taken_over: usize,
    pub handed_over: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Present in the list but owned by a higher-ranked subscription, or
    /// orphaned with adoption disabled.
    pub skipped: usize,
}

impl MergeReport {
    /// Number of permission records written or deleted.
    pub fn mutations(&self) -> usize {
        self.created + self.refreshed + self.adopted + self.taken_over + self.handed_over + self.deleted
    }
}

/// What happened to the records of a deleted subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub handed_over: usize,
    pub deleted: usize,
    pub orphaned: usize,
}

/// What to do with a released record nobody else claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unclaimed {
    Delete,
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Released {
    HandedOver,
    Deleted,
    Orphaned,
}

/// Merge the parsed list `entries` of subscription `id` into the store.
///
/// Fails with [`MergeError::SubscriptionGone`] if the subscription was
/// deleted since the list was fetched, and with [`MergeError::Conflict`] if a
/// record changed owner between read and write. In both cases the caller's
/// transaction must be rolled back.
pub fn merge_entries<S>(
    store: &S,
    id: SubscriptionId,
    entries: &[ParsedEntry],
    now: DateTime<Utc>,
) -> Result<MergeReport, MergeError>
where
    S: PermissionStore + ?Sized,
{
    let sub = store
        .get_subscription(id)?
        .ok_or(MergeError::SubscriptionGone(id))?;
    let ptype = sub.permission_type;
    let rank = sub.rank();

    store.replace_claims(id, ptype, entries)?;

    let mut report = MergeReport::default();
    let mut listed = HashSet::with_capacity(entries.len());

    for entry in entries {
        listed.insert(entry.domain.as_str());

        let Some(existing) = store.get_permission(&entry.domain, ptype)? else {
            let state = if sub.as_draft {
                PermissionState::Draft
            } else {
                PermissionState::Active
            };
            let perm = DomainPermission::from_entry(entry, ptype, Some(id), state, now);
            write(store, &perm, Precondition::Absent)?;
            report.created += 1;
            continue;
        };

        match existing.subscription_id {
            Some(owner) if owner == id => {
                // Another claimant may have gained rank since we took it.
                let claims = store.list_claimants(&entry.domain, ptype)?;
                match best_claim(claims, None) {
                    Some(best) if best.rank.id != id => {
                        let perm = existing.reassigned(Some(best.rank.id), &best.entry, now);
                        write(store, &perm, Precondition::OwnedBy(Some(id)))?;
                        debug!(domain = %entry.domain, to = %best.rank.id, "handed over to higher-ranked claimant");
                        report.handed_over += 1;
                    }
                    _ if existing.metadata_matches(entry) => report.unchanged += 1,
                    _ => {
                        let perm = existing.reassigned(Some(id), entry, now);
                        write(store, &perm, Precondition::OwnedBy(Some(id)))?;
                        report.refreshed += 1;
                    }
                }
            }
            None if sub.adopt_orphans => {
                let perm = existing.reassigned(Some(id), entry, now);
                write(store, &perm, Precondition::OwnedBy(None))?;
                report.adopted += 1;
            }
            None => report.skipped += 1,
            Some(owner) => {
                let take = match store.get_subscription(owner)? {
                    // Owner deleted without releasing its records.
                    None => true,
                    Some(other) => {
                        if other.priority == sub.priority {
                            warn!(
                                domain = %entry.domain,
                                permission_type = %ptype,
                                priority = sub.priority,
                                "equal-priority subscriptions claim the same domain; older one wins"
                            );
                        }
                        rank.outranks(&other.rank())
                    }
                };
                if take {
                    let perm = existing.reassigned(Some(id), entry, now);
                    write(store, &perm, Precondition::OwnedBy(Some(owner)))?;
                    report.taken_over += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }
    }

    for perm in store.list_owned_by(id, ptype)? {
        if listed.contains(perm.domain.as_str()) {
            continue;
        }
        match release(store, &perm, id, Unclaimed::Delete, now)? {
            Released::HandedOver => report.handed_over += 1,
            Released::Deleted | Released::Orphaned => report.deleted += 1,
        }
    }

    debug!(subscription = %id, ?report, "merged list");
    Ok(report)
}

/// Delete subscription `id`, first giving each record it owns to the best
/// remaining claimant. Unclaimed records are deleted when `remove_children`
/// is set and orphaned otherwise.
pub fn remove_subscription<S>(
    store: &S,
    id: SubscriptionId,
    remove_children: bool,
    now: DateTime<Utc>,
) -> Result<RemovalReport, MergeError>
where
    S: PermissionStore + ?Sized,
{
    let sub = store
        .get_subscription(id)?
        .ok_or(MergeError::SubscriptionGone(id))?;
    let unclaimed = if remove_children {
        Unclaimed::Delete
    } else {
        Unclaimed::Orphan
    };

    let mut report = RemovalReport::default();
    for perm in store.list_owned_by(id, sub.permission_type)? {
        match release(store, &perm, id, unclaimed, now)? {
            Released::HandedOver => report.handed_over += 1,
            Released::Deleted => report.deleted += 1,
            Released::Orphaned => report.orphaned += 1,
        }
    }

    store.delete_subscription(id)?;
    debug!(subscription = %id, ?report, "removed subscription");
    Ok(report)
}

/// Give up `from`'s ownership of `perm`: hand it to the best other claimant,
/// carrying that claimant's metadata, or apply `unclaimed`.
fn release<S>(
    store: &S,
    perm: &DomainPermission,
    from: SubscriptionId,
    unclaimed: Unclaimed,
    now: DateTime<Utc>,
) -> Result<Released, MergeError>
where
    S: PermissionStore + ?Sized,
{
    let claims = store.list_claimants(&perm.domain, perm.permission_type)?;
    let expected = Precondition::OwnedBy(Some(from));

    if let Some(best) = best_claim(claims, Some(from)) {
        let next = perm.reassigned(Some(best.rank.id), &best.entry, now);
        write(store, &next, expected)?;
        return Ok(Released::HandedOver);
    }

    match unclaimed {
        Unclaimed::Delete => {
            match store.delete_permission(&perm.domain, perm.permission_type, Some(from))? {
                DeleteOutcome::Deleted => Ok(Released::Deleted),
                DeleteOutcome::NotFound => Err(conflict(&perm.domain, perm.permission_type)),
            }
        }
        Unclaimed::Orphan => {
            let next = DomainPermission {
                subscription_id: None,
                updated_at: now,
                ..perm.clone()
            };
            write(store, &next, expected)?;
            Ok(Released::Orphaned)
        }
    }
}

/// Highest-ranked claim, ignoring `excluding`.
fn best_claim(claims: Vec<Claim>, excluding: Option<SubscriptionId>) -> Option<Claim> {
    claims
        .into_iter()
        .filter(|c| Some(c.rank.id) != excluding)
        .reduce(|best, c| if c.rank.outranks(&best.rank) { c } else { best })
}

fn write<S>(store: &S, perm: &DomainPermission, precondition: Precondition) -> Result<(), MergeError>
where
    S: PermissionStore + ?Sized,
{
    match store.upsert_permission(perm, precondition)? {
        WriteOutcome::Written => Ok(()),
        WriteOutcome::Conflict => Err(conflict(&perm.domain, perm.permission_type)),
    }
}

fn conflict(domain: &str, permission_type: PermissionType) -> MergeError {
    MergeError::Conflict {
        domain: domain.to_string(),
        permission_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{block_subscription, entries};
    use permsync_shared::parse_list;
    use permsync_shared::ContentType;
    use permsync_store::{Connection, Database, StoreError, Subscription, SyncMark};
    use std::cell::Cell;

    fn merge(db: &mut Database, id: SubscriptionId, list: &[ParsedEntry]) -> MergeReport {
        db.transaction(|conn| merge_entries(conn, id, list, Utc::now()))
            .unwrap()
    }

    fn owner(db: &Database, domain: &str) -> Option<SubscriptionId> {
        db.conn()
            .get_permission(domain, PermissionType::Block)
            .unwrap()
            .expect("record exists")
            .subscription_id
    }

    fn add(db: &Database, sub: &Subscription) {
        db.create_subscription(sub).unwrap();
    }

    #[test]
    fn test_creates_drafts_or_active() {
        let mut db = Database::open_in_memory().unwrap();
        let drafts = block_subscription(10, "https://lists.example/a.txt");
        let mut active = block_subscription(10, "https://lists.example/b.txt");
        active.as_draft = false;
        add(&db, &drafts);
        add(&db, &active);

        let report = merge(&mut db, drafts.id, &entries(&["a.example", "b.example"]));
        assert_eq!(report.created, 2);
        merge(&mut db, active.id, &entries(&["c.example"]));

        let perm = db.conn().get_permission("a.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.state, PermissionState::Draft);
        assert_eq!(perm.subscription_id, Some(drafts.id));
        let perm = db.conn().get_permission("c.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.state, PermissionState::Active);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.txt");
        add(&db, &sub);
        let list = entries(&["a.example", "b.example"]);

        merge(&mut db, sub.id, &list);
        let before = db.list_permissions(None, None).unwrap();

        let report = merge(&mut db, sub.id, &list);
        assert_eq!(report.mutations(), 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(db.list_permissions(None, None).unwrap(), before);
    }

    #[test]
    fn test_metadata_refresh_keeps_state() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.txt");
        add(&db, &sub);

        merge(&mut db, sub.id, &entries(&["a.example"]));
        db.approve_draft("a.example", PermissionType::Block, Utc::now()).unwrap();

        let mut changed = ParsedEntry::bare("a.example");
        changed.public_comment = Some("spam".into());
        changed.obfuscate = Some(true);
        let report = merge(&mut db, sub.id, &[changed]);
        assert_eq!(report.refreshed, 1);

        let perm = db.conn().get_permission("a.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.state, PermissionState::Active);
        assert_eq!(perm.public_comment.as_deref(), Some("spam"));
        assert_eq!(perm.obfuscate, Some(true));
    }

    #[test]
    fn test_higher_priority_wins_in_either_order() {
        let mut db = Database::open_in_memory().unwrap();
        let low = block_subscription(10, "https://lists.example/low.txt");
        let high = block_subscription(20, "https://lists.example/high.txt");
        add(&db, &low);
        add(&db, &high);
        let list = entries(&["evil.example"]);

        merge(&mut db, low.id, &list);
        let report = merge(&mut db, high.id, &list);
        assert_eq!(report.taken_over, 1);
        assert_eq!(owner(&db, "evil.example"), Some(high.id));

        let report = merge(&mut db, low.id, &list);
        assert_eq!(report.skipped, 1);
        assert_eq!(owner(&db, "evil.example"), Some(high.id));
    }

    #[test]
    fn test_takeover_preserves_state() {
        let mut db = Database::open_in_memory().unwrap();
        let low = block_subscription(10, "https://lists.example/low.txt");
        let high = block_subscription(20, "https://lists.example/high.txt");
        add(&db, &low);
        add(&db, &high);

        merge(&mut db, low.id, &entries(&["evil.example"]));
        db.approve_draft("evil.example", PermissionType::Block, Utc::now()).unwrap();
        merge(&mut db, high.id, &entries(&["evil.example"]));

        let perm = db.conn().get_permission("evil.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.subscription_id, Some(high.id));
        assert_eq!(perm.state, PermissionState::Active);
    }

    #[test]
    fn test_deleting_winner_falls_back_to_lower_claimant() {
        let mut db = Database::open_in_memory().unwrap();
        let low = block_subscription(10, "https://lists.example/low.txt");
        let high = block_subscription(20, "https://lists.example/high.txt");
        add(&db, &low);
        add(&db, &high);
        let list = entries(&["evil.example"]);

        merge(&mut db, low.id, &list);
        merge(&mut db, high.id, &list);

        let removal = db
            .transaction(|conn| remove_subscription(conn, high.id, true, Utc::now()))
            .unwrap();
        assert_eq!(removal.handed_over, 1);
        assert_eq!(owner(&db, "evil.example"), Some(low.id));

        let report = merge(&mut db, low.id, &list);
        assert_eq!(report.unchanged, 1);
        assert_eq!(owner(&db, "evil.example"), Some(low.id));
    }

    #[test]
    fn test_record_of_vanished_owner_is_taken() {
        let mut db = Database::open_in_memory().unwrap();
        let gone = block_subscription(200, "https://lists.example/gone.txt");
        let low = block_subscription(1, "https://lists.example/low.txt");
        add(&db, &gone);
        add(&db, &low);
        let list = entries(&["evil.example"]);

        merge(&mut db, gone.id, &list);
        // Drop the row directly, bypassing the hand-over.
        db.conn().delete_subscription(gone.id).unwrap();

        let report = merge(&mut db, low.id, &list);
        assert_eq!(report.taken_over, 1);
        assert_eq!(owner(&db, "evil.example"), Some(low.id));
    }

    #[test]
    fn test_lowered_priority_hands_over() {
        let mut db = Database::open_in_memory().unwrap();
        let a = block_subscription(10, "https://lists.example/a.txt");
        let mut b = block_subscription(20, "https://lists.example/b.txt");
        add(&db, &a);
        add(&db, &b);
        let list = entries(&["evil.example"]);

        merge(&mut db, a.id, &list);
        merge(&mut db, b.id, &list);

        b.priority = 5;
        db.update_subscription(&b).unwrap();
        let report = merge(&mut db, b.id, &list);
        assert_eq!(report.handed_over, 1);
        assert_eq!(owner(&db, "evil.example"), Some(a.id));
    }

    #[test]
    fn test_equal_priority_older_wins() {
        let mut db = Database::open_in_memory().unwrap();
        let older = block_subscription(10, "https://lists.example/older.txt");
        let newer = block_subscription(10, "https://lists.example/newer.txt");
        assert!(older.id < newer.id);
        add(&db, &older);
        add(&db, &newer);
        let list = entries(&["evil.example"]);

        merge(&mut db, newer.id, &list);
        merge(&mut db, older.id, &list);
        assert_eq!(owner(&db, "evil.example"), Some(older.id));

        merge(&mut db, newer.id, &list);
        assert_eq!(owner(&db, "evil.example"), Some(older.id));
    }

    #[test]
    fn test_orphan_adoption() {
        let mut db = Database::open_in_memory().unwrap();
        let keep_out = block_subscription(10, "https://lists.example/a.txt");
        let mut adopter = block_subscription(5, "https://lists.example/b.txt");
        adopter.adopt_orphans = true;
        add(&db, &keep_out);
        add(&db, &adopter);

        let orphan = db
            .create_orphan_permission(&ParsedEntry::bare("evil.example"), PermissionType::Block, Utc::now())
            .unwrap();
        let list = entries(&["evil.example"]);

        let report = merge(&mut db, keep_out.id, &list);
        assert_eq!(report.skipped, 1);
        assert_eq!(owner(&db, "evil.example"), None);

        let report = merge(&mut db, adopter.id, &list);
        assert_eq!(report.adopted, 1);
        let perm = db.conn().get_permission("evil.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.subscription_id, Some(adopter.id));
        assert_eq!(perm.state, orphan.state);
        assert_eq!(perm.created_at, orphan.created_at);
    }

    #[test]
    fn test_dropped_entries_released() {
        let mut db = Database::open_in_memory().unwrap();
        let low = block_subscription(10, "https://lists.example/low.txt");
        let high = block_subscription(20, "https://lists.example/high.txt");
        add(&db, &low);
        add(&db, &high);

        let mut annotated = ParsedEntry::bare("shared.example");
        annotated.public_comment = Some("from low".into());
        merge(&mut db, low.id, &[annotated]);
        merge(&mut db, high.id, &entries(&["shared.example", "solo.example"]));
        assert_eq!(owner(&db, "shared.example"), Some(high.id));

        let report = merge(&mut db, high.id, &[]);
        assert_eq!(report.handed_over, 1);
        assert_eq!(report.deleted, 1);

        let perm = db.conn().get_permission("shared.example", PermissionType::Block).unwrap().unwrap();
        assert_eq!(perm.subscription_id, Some(low.id));
        assert_eq!(perm.public_comment.as_deref(), Some("from low"));
        assert!(db.conn().get_permission("solo.example", PermissionType::Block).unwrap().is_none());
    }

    #[test]
    fn test_removal_orphans_unclaimed_records() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.txt");
        add(&db, &sub);
        merge(&mut db, sub.id, &entries(&["a.example", "b.example"]));

        let removal = db
            .transaction(|conn| remove_subscription(conn, sub.id, false, Utc::now()))
            .unwrap();
        assert_eq!(removal.orphaned, 2);
        assert_eq!(owner(&db, "a.example"), None);
        assert!(matches!(db.get_subscription(sub.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_removal_deletes_unclaimed_records() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.txt");
        add(&db, &sub);
        merge(&mut db, sub.id, &entries(&["a.example"]));

        let removal = db
            .transaction(|conn| remove_subscription(conn, sub.id, true, Utc::now()))
            .unwrap();
        assert_eq!(removal.deleted, 1);
        assert!(db.list_permissions(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_permission_types_are_independent() {
        let mut db = Database::open_in_memory().unwrap();
        let block = block_subscription(10, "https://lists.example/block.txt");
        let mut allow = block_subscription(1, "https://lists.example/allow.txt");
        allow.permission_type = PermissionType::Allow;
        add(&db, &block);
        add(&db, &allow);
        let list = entries(&["both.example"]);

        merge(&mut db, block.id, &list);
        let report = merge(&mut db, allow.id, &list);
        assert_eq!(report.created, 1);

        let allowed = db.conn().get_permission("both.example", PermissionType::Allow).unwrap().unwrap();
        assert_eq!(allowed.subscription_id, Some(allow.id));
        assert_eq!(owner(&db, "both.example"), Some(block.id));
    }

    #[test]
    fn test_gone_subscription_mutates_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .transaction(|conn| merge_entries(conn, SubscriptionId::new(), &entries(&["a.example"]), Utc::now()))
            .unwrap_err();
        assert!(matches!(err, MergeError::SubscriptionGone(_)));
        assert!(db.list_permissions(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_failure_leaves_store_untouched() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.json");
        add(&db, &sub);
        merge(&mut db, sub.id, &entries(&["kept.example"]));
        let before = db.list_permissions(None, None).unwrap();

        let body = br#"[{"domain": "new.example"}, {"public_comment": "no domain"}]"#;
        assert!(parse_list(ContentType::Json, body).is_err());
        assert_eq!(db.list_permissions(None, None).unwrap(), before);
    }

    /// Delegates to a connection but reports a conflict on the nth write.
    struct ConflictOnWrite<'a> {
        conn: &'a Connection,
        remaining: Cell<usize>,
    }

    impl PermissionStore for ConflictOnWrite<'_> {
        fn get_subscription(&self, id: SubscriptionId) -> permsync_store::Result<Option<Subscription>> {
            self.conn.get_subscription(id)
        }
        fn delete_subscription(&self, id: SubscriptionId) -> permsync_store::Result<bool> {
            self.conn.delete_subscription(id)
        }
        fn get_permission(
            &self,
            domain: &str,
            permission_type: PermissionType,
        ) -> permsync_store::Result<Option<DomainPermission>> {
            self.conn.get_permission(domain, permission_type)
        }
        fn upsert_permission(
            &self,
            perm: &DomainPermission,
            precondition: Precondition,
        ) -> permsync_store::Result<WriteOutcome> {
            if self.remaining.get() == 0 {
                return Ok(WriteOutcome::Conflict);
            }
            self.remaining.set(self.remaining.get() - 1);
            self.conn.upsert_permission(perm, precondition)
        }
        fn delete_permission(
            &self,
            domain: &str,
            permission_type: PermissionType,
            expected_owner: Option<SubscriptionId>,
        ) -> permsync_store::Result<DeleteOutcome> {
            self.conn.delete_permission(domain, permission_type, expected_owner)
        }
        fn list_owned_by(
            &self,
            id: SubscriptionId,
            permission_type: PermissionType,
        ) -> permsync_store::Result<Vec<DomainPermission>> {
            self.conn.list_owned_by(id, permission_type)
        }
        fn replace_claims(
            &self,
            id: SubscriptionId,
            permission_type: PermissionType,
            entries: &[ParsedEntry],
        ) -> permsync_store::Result<()> {
            self.conn.replace_claims(id, permission_type, entries)
        }
        fn list_claims(&self, id: SubscriptionId) -> permsync_store::Result<Vec<ParsedEntry>> {
            self.conn.list_claims(id)
        }
        fn list_claimants(
            &self,
            domain: &str,
            permission_type: PermissionType,
        ) -> permsync_store::Result<Vec<Claim>> {
            self.conn.list_claimants(domain, permission_type)
        }
        fn record_sync_success(&self, id: SubscriptionId, mark: &SyncMark) -> permsync_store::Result<bool> {
            self.conn.record_sync_success(id, mark)
        }
    }

    #[test]
    fn test_conflict_rolls_back_whole_merge() {
        let mut db = Database::open_in_memory().unwrap();
        let sub = block_subscription(10, "https://lists.example/a.txt");
        add(&db, &sub);

        let err = db
            .transaction(|conn| {
                let store = ConflictOnWrite {
                    conn,
                    remaining: Cell::new(2),
                };
                merge_entries(&store, sub.id, &entries(&["a.example", "b.example", "c.example"]), Utc::now())
            })
            .unwrap_err();

        assert!(matches!(err, MergeError::Conflict { ref domain, .. } if domain == "c.example"));
        assert!(db.list_permissions(None, None).unwrap().is_empty());
        assert!(db.conn().list_claimants("a.example", PermissionType::Block).unwrap().is_empty());
    }
}
