//! Domain permission records and the [`PermissionStore`] interface consumed
//! by the merge engine.
//!
//! Writes are conditional on the owner the caller expects to find, so a
//! record edited concurrently (by a moderator, for instance) is reported as a
//! conflict rather than silently overwritten.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use permsync_shared::{ParsedEntry, PermissionState, PermissionType, SubscriptionId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    Claim, DeleteOutcome, DomainPermission, Precondition, Rank, Subscription, SyncMark,
    WriteOutcome,
};
use crate::rows;
use crate::subscriptions;

const PERMISSION_COLUMNS: &str = "domain, permission_type, subscription_id, state, obfuscate, \
     public_comment, private_comment, created_at, updated_at";

/// Storage operations the merge engine needs.
///
/// Implemented for [`rusqlite::Connection`], which makes both a plain
/// connection and an open transaction usable as a store.
pub trait PermissionStore {
    fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// Delete a subscription and its claim set. Returns `false` if it did not
    /// exist.
    fn delete_subscription(&self, id: SubscriptionId) -> Result<bool>;

    fn get_permission(
        &self,
        domain: &str,
        permission_type: PermissionType,
    ) -> Result<Option<DomainPermission>>;

    /// Insert or update `perm` if `precondition` holds for its key.
    fn upsert_permission(
        &self,
        perm: &DomainPermission,
        precondition: Precondition,
    ) -> Result<WriteOutcome>;

    /// Delete the record for the key if it is owned by `expected_owner`.
    fn delete_permission(
        &self,
        domain: &str,
        permission_type: PermissionType,
        expected_owner: Option<SubscriptionId>,
    ) -> Result<DeleteOutcome>;

    fn list_owned_by(
        &self,
        id: SubscriptionId,
        permission_type: PermissionType,
    ) -> Result<Vec<DomainPermission>>;

    /// Replace a subscription's claim set with `entries`.
    fn replace_claims(
        &self,
        id: SubscriptionId,
        permission_type: PermissionType,
        entries: &[ParsedEntry],
    ) -> Result<()>;

    /// A subscription's claim set, in the order it was stored.
    fn list_claims(&self, id: SubscriptionId) -> Result<Vec<ParsedEntry>>;

    /// Every subscription whose claim set contains the key.
    fn list_claimants(&self, domain: &str, permission_type: PermissionType) -> Result<Vec<Claim>>;

    /// Mark a subscription as successfully synced.
    fn record_sync_success(&self, id: SubscriptionId, mark: &SyncMark) -> Result<bool>;
}

impl PermissionStore for Connection {
    fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        subscriptions::find_subscription(self, id)
    }

    fn delete_subscription(&self, id: SubscriptionId) -> Result<bool> {
        subscriptions::delete_subscription_row(self, id)
    }

    fn get_permission(
        &self,
        domain: &str,
        permission_type: PermissionType,
    ) -> Result<Option<DomainPermission>> {
        self.query_row(
            &format!(
                "SELECT {PERMISSION_COLUMNS} FROM domain_permissions
                 WHERE domain = ?1 AND permission_type = ?2"
            ),
            params![domain, permission_type.as_str()],
            row_to_permission,
        )
        .optional()
        .map_err(StoreError::Sqlite)
    }

    fn upsert_permission(
        &self,
        perm: &DomainPermission,
        precondition: Precondition,
    ) -> Result<WriteOutcome> {
        let owner = perm.subscription_id.map(|id| id.to_string());

        let affected = match precondition {
            Precondition::Absent => self.execute(
                &format!(
                    "INSERT INTO domain_permissions ({PERMISSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (domain, permission_type) DO NOTHING"
                ),
                params![
                    perm.domain,
                    perm.permission_type.as_str(),
                    owner,
                    perm.state.as_str(),
                    perm.obfuscate,
                    perm.public_comment,
                    perm.private_comment,
                    perm.created_at.to_rfc3339(),
                    perm.updated_at.to_rfc3339(),
                ],
            )?,
            Precondition::OwnedBy(expected) => self.execute(
                "UPDATE domain_permissions
                 SET subscription_id = ?3, state = ?4, obfuscate = ?5,
                     public_comment = ?6, private_comment = ?7, updated_at = ?8
                 WHERE domain = ?1 AND permission_type = ?2 AND subscription_id IS ?9",
                params![
                    perm.domain,
                    perm.permission_type.as_str(),
                    owner,
                    perm.state.as_str(),
                    perm.obfuscate,
                    perm.public_comment,
                    perm.private_comment,
                    perm.updated_at.to_rfc3339(),
                    expected.map(|id| id.to_string()),
                ],
            )?,
        };

        Ok(if affected > 0 {
            WriteOutcome::Written
        } else {
            WriteOutcome::Conflict
        })
    }

    fn delete_permission(
        &self,
        domain: &str,
        permission_type: PermissionType,
        expected_owner: Option<SubscriptionId>,
    ) -> Result<DeleteOutcome> {
        let affected = self.execute(
            "DELETE FROM domain_permissions
             WHERE domain = ?1 AND permission_type = ?2 AND subscription_id IS ?3",
            params![
                domain,
                permission_type.as_str(),
                expected_owner.map(|id| id.to_string())
            ],
        )?;

        Ok(if affected > 0 {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    fn list_owned_by(
        &self,
        id: SubscriptionId,
        permission_type: PermissionType,
    ) -> Result<Vec<DomainPermission>> {
        let mut stmt = self.prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM domain_permissions
             WHERE subscription_id = ?1 AND permission_type = ?2
             ORDER BY domain ASC"
        ))?;
        let rows = stmt.query_map(
            params![id.to_string(), permission_type.as_str()],
            row_to_permission,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    fn replace_claims(
        &self,
        id: SubscriptionId,
        permission_type: PermissionType,
        entries: &[ParsedEntry],
    ) -> Result<()> {
        self.execute(
            "DELETE FROM subscription_claims WHERE subscription_id = ?1",
            params![id.to_string()],
        )?;

        let mut stmt = self.prepare(
            "INSERT OR REPLACE INTO subscription_claims
             (subscription_id, domain, permission_type, obfuscate, public_comment, private_comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for entry in entries {
            stmt.execute(params![
                id.to_string(),
                entry.domain,
                permission_type.as_str(),
                entry.obfuscate,
                entry.public_comment,
                entry.private_comment,
            ])?;
        }
        Ok(())
    }

    fn list_claims(&self, id: SubscriptionId) -> Result<Vec<ParsedEntry>> {
        let mut stmt = self.prepare(
            "SELECT domain, obfuscate, public_comment, private_comment
             FROM subscription_claims
             WHERE subscription_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok(ParsedEntry {
                domain: row.get(0)?,
                obfuscate: row.get(1)?,
                public_comment: row.get(2)?,
                private_comment: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    fn list_claimants(&self, domain: &str, permission_type: PermissionType) -> Result<Vec<Claim>> {
        let mut stmt = self.prepare(
            "SELECT c.subscription_id, s.priority, c.domain, c.obfuscate,
                    c.public_comment, c.private_comment
             FROM subscription_claims c
             JOIN subscriptions s ON s.id = c.subscription_id
             WHERE c.domain = ?1 AND c.permission_type = ?2
             ORDER BY s.priority DESC, c.subscription_id ASC",
        )?;
        let rows = stmt.query_map(params![domain, permission_type.as_str()], |row| {
            let priority: i64 = row.get(1)?;
            Ok(Claim {
                rank: Rank {
                    id: rows::subscription_id(row, 0)?,
                    priority: u8::try_from(priority).unwrap_or(u8::MAX),
                },
                entry: ParsedEntry {
                    domain: row.get(2)?,
                    obfuscate: row.get(3)?,
                    public_comment: row.get(4)?,
                    private_comment: row.get(5)?,
                },
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    fn record_sync_success(&self, id: SubscriptionId, mark: &SyncMark) -> Result<bool> {
        subscriptions::record_sync_success(self, id, mark)
    }
}

// ---------------------------------------------------------------------------
// Moderator operations
// ---------------------------------------------------------------------------

impl Database {
    pub fn list_permissions(
        &self,
        permission_type: Option<PermissionType>,
        state: Option<PermissionState>,
    ) -> Result<Vec<DomainPermission>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM domain_permissions
             WHERE (?1 IS NULL OR permission_type = ?1) AND (?2 IS NULL OR state = ?2)
             ORDER BY domain ASC, permission_type ASC"
        ))?;
        let rows = stmt.query_map(
            params![permission_type.map(|t| t.as_str()), state.map(|s| s.as_str())],
            row_to_permission,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Create an active permission that belongs to no subscription.
    pub fn create_orphan_permission(
        &self,
        entry: &ParsedEntry,
        permission_type: PermissionType,
        now: DateTime<Utc>,
    ) -> Result<DomainPermission> {
        let perm =
            DomainPermission::from_entry(entry, permission_type, None, PermissionState::Active, now);

        match self.conn().upsert_permission(&perm, Precondition::Absent)? {
            WriteOutcome::Written => Ok(perm),
            WriteOutcome::Conflict => Err(StoreError::Conflict(format!(
                "a {} permission for {} already exists",
                permission_type, entry.domain
            ))),
        }
    }

    /// Promote a draft to active. Returns the updated record.
    pub fn approve_draft(
        &self,
        domain: &str,
        permission_type: PermissionType,
        now: DateTime<Utc>,
    ) -> Result<DomainPermission> {
        let affected = self.conn().execute(
            "UPDATE domain_permissions SET state = ?3, updated_at = ?4
             WHERE domain = ?1 AND permission_type = ?2 AND state = ?5",
            params![
                domain,
                permission_type.as_str(),
                PermissionState::Active.as_str(),
                now.to_rfc3339(),
                PermissionState::Draft.as_str(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.conn()
            .query_row(
                &format!(
                    "SELECT {PERMISSION_COLUMNS} FROM domain_permissions
                     WHERE domain = ?1 AND permission_type = ?2"
                ),
                params![domain, permission_type.as_str()],
                row_to_permission,
            )
            .map_err(rows::map_not_found)
    }

    /// Remove a permission regardless of owner.
    pub fn remove_permission(&self, domain: &str, permission_type: PermissionType) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM domain_permissions WHERE domain = ?1 AND permission_type = ?2",
            params![domain, permission_type.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_permission(row: &rusqlite::Row<'_>) -> rusqlite::Result<DomainPermission> {
    Ok(DomainPermission {
        domain: row.get(0)?,
        permission_type: rows::parsed(row, 1)?,
        subscription_id: rows::opt_subscription_id(row, 2)?,
        state: rows::parsed(row, 3)?,
        obfuscate: row.get(4)?,
        public_comment: row.get(5)?,
        private_comment: row.get(6)?,
        created_at: rows::timestamp(row, 7)?,
        updated_at: rows::timestamp(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::subscription;

    fn block(domain: &str, owner: Option<SubscriptionId>) -> DomainPermission {
        DomainPermission::from_entry(
            &ParsedEntry::bare(domain),
            PermissionType::Block,
            owner,
            PermissionState::Draft,
            Utc::now(),
        )
    }

    #[test]
    fn test_conditional_insert() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let perm = block("evil.example", None);

        assert_eq!(
            conn.upsert_permission(&perm, Precondition::Absent).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            conn.upsert_permission(&perm, Precondition::Absent).unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            conn.get_permission("evil.example", PermissionType::Block).unwrap(),
            Some(perm)
        );
        assert_eq!(conn.get_permission("evil.example", PermissionType::Allow).unwrap(), None);
    }

    #[test]
    fn test_conditional_update_checks_owner() {
        let db = Database::open_in_memory().unwrap();
        let sub = subscription(PermissionType::Block, 1, "https://lists.example/a.txt");
        db.create_subscription(&sub).unwrap();
        let conn = db.conn();

        conn.upsert_permission(&block("evil.example", None), Precondition::Absent)
            .unwrap();

        let adopted = block("evil.example", Some(sub.id));
        assert_eq!(
            conn.upsert_permission(&adopted, Precondition::OwnedBy(Some(sub.id)))
                .unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            conn.upsert_permission(&adopted, Precondition::OwnedBy(None)).unwrap(),
            WriteOutcome::Written
        );

        let owned = conn.list_owned_by(sub.id, PermissionType::Block).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].domain, "evil.example");
    }

    #[test]
    fn test_conditional_delete() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let owner = SubscriptionId::new();
        conn.upsert_permission(&block("evil.example", Some(owner)), Precondition::Absent)
            .unwrap();

        assert_eq!(
            conn.delete_permission("evil.example", PermissionType::Block, None)
                .unwrap(),
            DeleteOutcome::NotFound
        );
        assert_eq!(
            conn.delete_permission("evil.example", PermissionType::Block, Some(owner))
                .unwrap(),
            DeleteOutcome::Deleted
        );
    }

    #[test]
    fn test_claims_ranked_and_cascade() {
        let db = Database::open_in_memory().unwrap();
        let low = subscription(PermissionType::Block, 10, "https://lists.example/low.txt");
        let high = subscription(PermissionType::Block, 20, "https://lists.example/high.txt");
        db.create_subscription(&low).unwrap();
        db.create_subscription(&high).unwrap();
        let conn = db.conn();

        let entries = vec![ParsedEntry::bare("evil.example")];
        conn.replace_claims(low.id, PermissionType::Block, &entries).unwrap();
        conn.replace_claims(high.id, PermissionType::Block, &entries).unwrap();

        let listed = vec![
            ParsedEntry {
                public_comment: Some("spam".into()),
                ..ParsedEntry::bare("zeta.example")
            },
            ParsedEntry::bare("alpha.example"),
        ];
        conn.replace_claims(high.id, PermissionType::Block, &listed).unwrap();
        assert_eq!(conn.list_claims(high.id).unwrap(), listed);
        conn.replace_claims(high.id, PermissionType::Block, &entries).unwrap();

        let claims = conn.list_claimants("evil.example", PermissionType::Block).unwrap();
        let ranks: Vec<_> = claims.iter().map(|c| c.rank).collect();
        assert_eq!(ranks, vec![high.rank(), low.rank()]);

        // Replacing drops old claims.
        conn.replace_claims(low.id, PermissionType::Block, &[]).unwrap();
        assert_eq!(
            conn.list_claimants("evil.example", PermissionType::Block).unwrap().len(),
            1
        );

        assert!(conn.delete_subscription(high.id).unwrap());
        assert!(conn
            .list_claimants("evil.example", PermissionType::Block)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_moderator_operations() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let orphan = db
            .create_orphan_permission(&ParsedEntry::bare("spam.example"), PermissionType::Block, now)
            .unwrap();
        assert!(orphan.is_orphan());
        assert_eq!(orphan.state, PermissionState::Active);
        assert!(matches!(
            db.create_orphan_permission(&ParsedEntry::bare("spam.example"), PermissionType::Block, now),
            Err(StoreError::Conflict(_))
        ));

        db.conn()
            .upsert_permission(&block("draft.example", None), Precondition::Absent)
            .unwrap();
        let drafts = db
            .list_permissions(Some(PermissionType::Block), Some(PermissionState::Draft))
            .unwrap();
        assert_eq!(drafts.len(), 1);

        let approved = db.approve_draft("draft.example", PermissionType::Block, now).unwrap();
        assert_eq!(approved.state, PermissionState::Active);
        assert!(matches!(
            db.approve_draft("draft.example", PermissionType::Block, now),
            Err(StoreError::NotFound)
        ));

        assert!(db.remove_permission("spam.example", PermissionType::Block).unwrap());
        assert_eq!(db.list_permissions(None, None).unwrap().len(), 1);
    }
}
