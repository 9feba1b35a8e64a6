use thiserror::Error;

use permsync_net::FetchError;
use permsync_shared::error::{CryptoError, ParseError};
use permsync_shared::{PermissionType, SubscriptionId};
use permsync_store::StoreError;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("subscription {0} no longer exists")]
    SubscriptionGone(SubscriptionId),

    #[error("{permission_type} permission for {domain} was modified concurrently")]
    Conflict {
        domain: String,
        permission_type: PermissionType,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a sync cycle did not complete. Recorded on the subscription as
/// `last_fetch_error`, except for the two discard cases.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("merge failed: {0}")]
    Merge(MergeError),

    #[error("fetch credentials unreadable: {0}")]
    Credentials(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("store lock poisoned")]
    Poisoned,

    /// The subscription was deleted; results are discarded.
    #[error("subscription {0} no longer exists")]
    SubscriptionGone(SubscriptionId),

    /// The worker was stopped mid-cycle; results are discarded.
    #[error("cycle cancelled")]
    Cancelled,
}

impl CycleError {
    /// Cycles that end this way leave no trace on the subscription.
    pub fn is_discard(&self) -> bool {
        matches!(self, Self::SubscriptionGone(_) | Self::Cancelled)
    }
}

impl From<MergeError> for CycleError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::SubscriptionGone(id) => CycleError::SubscriptionGone(id),
            other => CycleError::Merge(other),
        }
    }
}
