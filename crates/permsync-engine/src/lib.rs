//! # permsync-engine
//!
//! Keeps domain permissions in line with the remote lists they are
//! subscribed to.
//!
//! - [`merge`] reconciles one parsed list with the store.
//! - [`cycle`] runs fetch, parse and merge for one subscription and records
//!   the outcome.
//! - [`scheduler`] owns one worker per subscription and decides when cycles
//!   run.

pub mod cycle;
pub mod error;
pub mod locks;
pub mod merge;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testing;

pub use cycle::{CycleOutcome, CycleState, SharedDb, SyncEngine};
pub use error::{CycleError, MergeError};
pub use merge::{merge_entries, remove_subscription, MergeReport, RemovalReport};
pub use scheduler::{ScheduleConfig, Scheduler};
pub use source::ListSource;
