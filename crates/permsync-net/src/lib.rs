//! Network access for permsync: fetching remote permission lists over HTTP.

pub mod fetch;

pub use fetch::{BasicAuth, FetchError, FetchOutcome, FetchRequest, FetchedList, Fetcher};
