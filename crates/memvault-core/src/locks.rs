//! Striped per-slice locks.
//!
//! Mutations of one slice id are serialised; distinct slices usually land on
//! different stripes and proceed in parallel. Reads take the shared side and
//! only wait while a write to the same stripe is committing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::slice::SliceId;

pub(crate) const DEFAULT_STRIPES: usize = 64;

pub(crate) struct StripedLocks {
    stripes: Vec<RwLock<()>>,
}

impl StripedLocks {
    pub(crate) fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| RwLock::new(())).collect(),
        }
    }

    fn stripe(&self, id: &SliceId) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let len = self.stripes.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % len) as usize;
        &self.stripes[index]
    }

    pub(crate) async fn read(&self, id: &SliceId) -> RwLockReadGuard<'_, ()> {
        self.stripe(id).read().await
    }

    pub(crate) async fn write(&self, id: &SliceId) -> RwLockWriteGuard<'_, ()> {
        self.stripe(id).write().await
    }

    /// Every stripe, exclusively, acquired in order. Dropping the guards
    /// straight away waits out all writes already in progress.
    pub(crate) async fn write_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(stripe.write().await);
        }
        guards
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_id_writers_are_serialised() {
        let locks = Arc::new(StripedLocks::new(8));
        let id = SliceId::from_raw("abc");
        let guard = locks.write(&id).await;

        let contender = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = locks.write(&id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn readers_share_a_stripe() {
        let locks = StripedLocks::new(1);
        let id = SliceId::from_raw("abc");
        let _a = locks.read(&id).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.read(&id)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn write_all_waits_for_in_flight_writers() {
        let locks = Arc::new(StripedLocks::new(4));
        let id = SliceId::from_raw("abc");
        let guard = locks.write(&id).await;

        let barrier = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guards = locks.write_all().await;
                guards.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!barrier.is_finished());

        drop(guard);
        assert_eq!(barrier.await.unwrap(), 4);
    }

    #[test]
    fn zero_stripes_still_works() {
        let locks = StripedLocks::new(0);
        assert_eq!(locks.stripes.len(), 1);
    }
}
