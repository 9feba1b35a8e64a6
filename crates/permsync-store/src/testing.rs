use chrono::Utc;

use permsync_shared::{ContentType, FetchStatus, PermissionType, SubscriptionId};

use crate::models::Subscription;

pub(crate) fn subscription(permission_type: PermissionType, priority: u8, uri: &str) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        priority,
        title: None,
        permission_type,
        uri: uri.to_string(),
        content_type: ContentType::Plain,
        fetch_username: None,
        fetch_password: None,
        as_draft: true,
        adopt_orphans: false,
        created_at: Utc::now(),
        last_fetch_status: FetchStatus::Never,
        last_fetch_error: None,
        last_fetched_at: None,
        last_success_at: None,
        etag: None,
        last_modified: None,
        entry_count: 0,
    }
}
