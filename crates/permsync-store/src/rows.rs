//! Column conversion helpers shared by the row mappers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use permsync_shared::SubscriptionId;

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Read a text column and parse it with `FromStr`.
pub(crate) fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn subscription_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<SubscriptionId> {
    let raw: String = row.get(idx)?;
    SubscriptionId::parse(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_subscription_id(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<SubscriptionId>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| SubscriptionId::parse(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

pub(crate) fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn map_not_found(e: rusqlite::Error) -> crate::error::StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => crate::error::StoreError::NotFound,
        other => crate::error::StoreError::Sqlite(other),
    }
}
