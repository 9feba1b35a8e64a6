//! Types and pure logic shared by every permsync crate: the subscription
//! vocabulary, domain normalization, list parsing and credential sealing.

pub mod constants;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod parse;
pub mod types;

pub use domain::normalize_domain;
pub use parse::{parse_list, ParsedEntry};
pub use types::{ContentType, FetchStatus, PermissionState, PermissionType, SubscriptionId};
