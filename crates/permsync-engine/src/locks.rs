use tokio::sync::{Mutex, MutexGuard};

use permsync_shared::PermissionType;

/// One merge at a time per permission type.
///
/// Merges of allow and block lists touch disjoint records and run
/// concurrently. `tokio::sync::Mutex` queues waiters in order, so merges of
/// one type apply in the order they asked for the lock.
#[derive(Debug, Default)]
pub struct MergeLocks {
    allow: Mutex<()>,
    block: Mutex<()>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, permission_type: PermissionType) -> MutexGuard<'_, ()> {
        match permission_type {
            PermissionType::Allow => self.allow.lock().await,
            PermissionType::Block => self.block.lock().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_types_lock_independently() {
        let locks = MergeLocks::new();
        let _block = locks.acquire(PermissionType::Block).await;

        let allow = tokio::time::timeout(Duration::from_millis(100), locks.acquire(PermissionType::Allow)).await;
        assert!(allow.is_ok());

        let block = tokio::time::timeout(Duration::from_millis(100), locks.acquire(PermissionType::Block)).await;
        assert!(block.is_err());
    }
}
