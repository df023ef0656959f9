use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tally_core::PrincipalId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per principal, created on demand.
///
/// Entries hold weak references; a principal's mutex lives only while some
/// caller holds or waits on it.
#[derive(Clone, Default)]
pub struct PrincipalLocks {
    inner: Arc<Mutex<HashMap<PrincipalId, Weak<AsyncMutex<()>>>>>,
}

impl PrincipalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: PrincipalId) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&id).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, weak| weak.strong_count() > 0);
        let fresh = Arc::new(AsyncMutex::new(()));
        map.insert(id, Arc::downgrade(&fresh));
        fresh
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: PrincipalId) -> OwnedMutexGuard<()> {
        self.slot(id).lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_principal_is_exclusive() {
        let locks = PrincipalLocks::new();
        let id = PrincipalId::new();
        let held = locks.acquire(id).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(id)).await;
        assert!(blocked.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire(id)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_principals_do_not_contend() {
        let locks = PrincipalLocks::new();
        let _a = locks.acquire(PrincipalId::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(PrincipalId::new())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = PrincipalLocks::new();
        for _ in 0..10 {
            let _g = locks.acquire(PrincipalId::new()).await;
        }
        let _g = locks.acquire(PrincipalId::new()).await;
        assert_eq!(locks.tracked(), 1);
    }
}
