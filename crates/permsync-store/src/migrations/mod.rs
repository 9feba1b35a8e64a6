//! Schema migrations, applied in order when a [`Database`] is opened.
//!
//! `PRAGMA user_version` holds the number of migrations already applied.
//!
//! [`Database`]: crate::Database

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = (&'static str, fn(&Connection) -> rusqlite::Result<()>);

/// Append only. Position `n` becomes schema version `n + 1`.
const MIGRATIONS: &[Migration] = &[("v001_initial", v001_initial::up)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(applied, available = MIGRATIONS.len(), "Checking schema version");

    for (version, (name, up)) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        tracing::info!(migration = name, "Applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", (version + 1) as u32)?;
    }

    Ok(())
}
