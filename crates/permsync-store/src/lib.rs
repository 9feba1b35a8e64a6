//! # permsync-store
//!
//! Durable storage for domain permission subscriptions, the permissions they
//! produce and their claim sets, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers, and the
//! [`PermissionStore`] trait the merge engine runs against (implemented for
//! any connection, including an open transaction).

pub mod database;
pub mod migrations;
pub mod models;
pub mod permissions;
pub mod subscriptions;

mod error;
mod rows;

#[cfg(test)]
mod testing;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use permissions::PermissionStore;
pub use rusqlite::Connection;
