//! Records persisted in the permission store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use permsync_shared::crypto::SealedCredential;
use permsync_shared::{
    ContentType, FetchStatus, ParsedEntry, PermissionState, PermissionType, SubscriptionId,
};

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A remote domain permission list this instance follows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Higher wins when two subscriptions claim the same domain.
    pub priority: u8,
    pub title: Option<String>,
    /// Fixed at creation.
    pub permission_type: PermissionType,
    /// Normalized absolute URI of the list.
    pub uri: String,
    /// Fixed at creation.
    pub content_type: ContentType,
    pub fetch_username: Option<String>,
    /// Sealed with the instance credential key, never serialized.
    #[serde(skip_serializing, default)]
    pub fetch_password: Option<SealedCredential>,
    /// Permissions created by this subscription start as drafts.
    pub as_draft: bool,
    /// Take over orphaned permissions present in the list.
    pub adopt_orphans: bool,
    pub created_at: DateTime<Utc>,
    pub last_fetch_status: FetchStatus,
    pub last_fetch_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Validators of the last merged response, for conditional fetches.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Entries in the last successfully parsed list.
    pub entry_count: i64,
}

impl Subscription {
    pub fn rank(&self) -> Rank {
        Rank {
            priority: self.priority,
            id: self.id,
        }
    }

    /// Both halves of the basic-auth pair are present.
    pub fn has_credentials(&self) -> bool {
        self.fetch_username.as_deref().is_some_and(|u| !u.is_empty())
            && self.fetch_password.is_some()
    }
}

/// Ordering key between subscriptions claiming the same domain.
///
/// Higher priority wins. Equal priorities are broken by the lower (older)
/// subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub priority: u8,
    pub id: SubscriptionId,
}

impl Rank {
    pub fn outranks(&self, other: &Rank) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.id < other.id)
    }
}

// ---------------------------------------------------------------------------
// Domain permission
// ---------------------------------------------------------------------------

/// An allow or block on one domain. At most one exists per
/// (domain, permission_type).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainPermission {
    pub domain: String,
    pub permission_type: PermissionType,
    /// `None` for orphans created directly by a moderator.
    pub subscription_id: Option<SubscriptionId>,
    pub state: PermissionState,
    pub obfuscate: Option<bool>,
    pub public_comment: Option<String>,
    pub private_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DomainPermission {
    /// A fresh record built from a list entry.
    pub fn from_entry(
        entry: &ParsedEntry,
        permission_type: PermissionType,
        subscription_id: Option<SubscriptionId>,
        state: PermissionState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: entry.domain.clone(),
            permission_type,
            subscription_id,
            state,
            obfuscate: entry.obfuscate,
            public_comment: entry.public_comment.clone(),
            private_comment: entry.private_comment.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.subscription_id.is_none()
    }

    pub fn metadata_matches(&self, entry: &ParsedEntry) -> bool {
        self.obfuscate == entry.obfuscate
            && self.public_comment == entry.public_comment
            && self.private_comment == entry.private_comment
    }

    /// Copy of this record with new ownership and the entry's metadata.
    /// State and creation time are preserved.
    pub fn reassigned(
        &self,
        owner: Option<SubscriptionId>,
        entry: &ParsedEntry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: owner,
            obfuscate: entry.obfuscate,
            public_comment: entry.public_comment.clone(),
            private_comment: entry.private_comment.clone(),
            updated_at: now,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Claims and write outcomes
// ---------------------------------------------------------------------------

/// One subscription's claim on a domain, with the metadata its list carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub rank: Rank,
    pub entry: ParsedEntry,
}

/// What a conditional write expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No record exists for the key.
    Absent,
    /// A record exists and is owned by this subscription (`None` = orphan).
    OwnedBy(Option<SubscriptionId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The precondition did not hold; nothing was written.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No record with the expected owner exists.
    NotFound,
}

/// Result of a successful sync, stored on the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMark {
    pub at: DateTime<Utc>,
    /// `None` when the list was not modified since the last sync; the
    /// previous count and validators are kept.
    pub refreshed: Option<ListValidators>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListValidators {
    pub entry_count: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_priority_then_id() {
        let older = SubscriptionId::new();
        let newer = SubscriptionId::new();

        let low = Rank { priority: 10, id: older };
        let high = Rank { priority: 20, id: newer };
        assert!(high.outranks(&low));
        assert!(!low.outranks(&high));

        let tie_old = Rank { priority: 5, id: older };
        let tie_new = Rank { priority: 5, id: newer };
        assert!(tie_old.outranks(&tie_new));
        assert!(!tie_new.outranks(&tie_old));
        assert!(!tie_old.outranks(&tie_old));
    }
}
