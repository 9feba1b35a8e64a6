use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use permsync_shared::crypto::SealedCredential;
use permsync_shared::{FetchStatus, PermissionType, SubscriptionId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Subscription, SyncMark};
use crate::rows;

const SUBSCRIPTION_COLUMNS: &str = "id, priority, title, permission_type, uri, content_type, \
     fetch_username, fetch_password, as_draft, adopt_orphans, created_at, last_fetch_status, \
     last_fetch_error, last_fetched_at, last_success_at, etag, last_modified, entry_count";

impl Database {
    /// Insert a new subscription. A duplicate `uri` is a
    /// [`StoreError::Conflict`].
    pub fn create_subscription(&self, sub: &Subscription) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    sub.id.to_string(),
                    i64::from(sub.priority),
                    sub.title,
                    sub.permission_type.as_str(),
                    sub.uri,
                    sub.content_type.as_str(),
                    sub.fetch_username,
                    sub.fetch_password.as_ref().map(|p| p.0.as_slice()),
                    sub.as_draft,
                    sub.adopt_orphans,
                    sub.created_at.to_rfc3339(),
                    sub.last_fetch_status.as_str(),
                    sub.last_fetch_error,
                    sub.last_fetched_at.map(|t| t.to_rfc3339()),
                    sub.last_success_at.map(|t| t.to_rfc3339()),
                    sub.etag,
                    sub.last_modified,
                    sub.entry_count,
                ],
            )
            .map_err(|e| {
                StoreError::from_write(e, &format!("a subscription for {} already exists", sub.uri))
            })?;

        tracing::debug!(id = %sub.id, uri = %sub.uri, "created subscription");
        Ok(())
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        find_subscription(self.conn(), id)?.ok_or(StoreError::NotFound)
    }

    /// All subscriptions, optionally of one permission type, highest
    /// priority first.
    pub fn list_subscriptions(
        &self,
        permission_type: Option<PermissionType>,
    ) -> Result<Vec<Subscription>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE (?1 IS NULL OR permission_type = ?1)
             ORDER BY priority DESC, id ASC"
        ))?;
        let rows = stmt.query_map(
            params![permission_type.map(|t| t.as_str())],
            row_to_subscription,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Persist the mutable fields of `sub`. `permission_type` and
    /// `content_type` are never rewritten. The stored validators are kept
    /// unless `uri` changes, in which case they are cleared.
    pub fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        let affected = self
            .conn()
            .execute(
                "UPDATE subscriptions
                 SET priority = ?2, title = ?3, uri = ?4, fetch_username = ?5,
                     fetch_password = ?6, as_draft = ?7, adopt_orphans = ?8,
                     etag = CASE WHEN uri = ?4 THEN etag END,
                     last_modified = CASE WHEN uri = ?4 THEN last_modified END
                 WHERE id = ?1",
                params![
                    sub.id.to_string(),
                    i64::from(sub.priority),
                    sub.title,
                    sub.uri,
                    sub.fetch_username,
                    sub.fetch_password.as_ref().map(|p| p.0.as_slice()),
                    sub.as_draft,
                    sub.adopt_orphans,
                ],
            )
            .map_err(|e| {
                StoreError::from_write(e, &format!("a subscription for {} already exists", sub.uri))
            })?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record a failed cycle. Returns `false` if the subscription is gone.
    pub fn record_fetch_error(
        &self,
        id: SubscriptionId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE subscriptions
             SET last_fetch_status = ?2, last_fetch_error = ?3, last_fetched_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                FetchStatus::Error.as_str(),
                message,
                at.to_rfc3339()
            ],
        )?;
        Ok(affected > 0)
    }
}

pub(crate) fn find_subscription(
    conn: &Connection,
    id: SubscriptionId,
) -> Result<Option<Subscription>> {
    conn.query_row(
        &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
        params![id.to_string()],
        row_to_subscription,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

// ON DELETE CASCADE: the claim set goes with it
pub(crate) fn delete_subscription_row(conn: &Connection, id: SubscriptionId) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM subscriptions WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(affected > 0)
}

pub(crate) fn record_sync_success(
    conn: &Connection,
    id: SubscriptionId,
    mark: &SyncMark,
) -> Result<bool> {
    let at = mark.at.to_rfc3339();
    let affected = match &mark.refreshed {
        Some(validators) => conn.execute(
            "UPDATE subscriptions
             SET last_fetch_status = ?2, last_fetch_error = NULL, last_fetched_at = ?3,
                 last_success_at = ?3, entry_count = ?4, etag = ?5, last_modified = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                FetchStatus::Success.as_str(),
                at,
                validators.entry_count,
                validators.etag,
                validators.last_modified,
            ],
        )?,
        None => conn.execute(
            "UPDATE subscriptions
             SET last_fetch_status = ?2, last_fetch_error = NULL, last_fetched_at = ?3,
                 last_success_at = ?3
             WHERE id = ?1",
            params![id.to_string(), FetchStatus::Success.as_str(), at],
        )?,
    };
    Ok(affected > 0)
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let priority: i64 = row.get(1)?;
    let priority = u8::try_from(priority).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    let fetch_password: Option<Vec<u8>> = row.get(7)?;

    Ok(Subscription {
        id: rows::subscription_id(row, 0)?,
        priority,
        title: row.get(2)?,
        permission_type: rows::parsed(row, 3)?,
        uri: row.get(4)?,
        content_type: rows::parsed(row, 5)?,
        fetch_username: row.get(6)?,
        fetch_password: fetch_password.map(SealedCredential),
        as_draft: row.get(8)?,
        adopt_orphans: row.get(9)?,
        created_at: rows::timestamp(row, 10)?,
        last_fetch_status: rows::parsed(row, 11)?,
        last_fetch_error: row.get(12)?,
        last_fetched_at: rows::opt_timestamp(row, 13)?,
        last_success_at: rows::opt_timestamp(row, 14)?,
        etag: row.get(15)?,
        last_modified: row.get(16)?,
        entry_count: row.get(17)?,
    })
}
