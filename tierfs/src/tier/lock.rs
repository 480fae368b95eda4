//! Per-virtual-path locks.
//!
//! Shared guards are held by operations that only observe a path; exclusive
//! guards cover migrations, shadow refreshes and namespace changes. Entries
//! are dropped from the table once no guard references them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::path::VirtualPath;

pub type SharedGuard = OwnedRwLockReadGuard<()>;
pub type ExclusiveGuard = OwnedRwLockWriteGuard<()>;

#[derive(Default)]
pub struct PathLocks {
    table: Mutex<HashMap<VirtualPath, Weak<RwLock<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &VirtualPath) -> Arc<RwLock<()>> {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = table.get(path).and_then(Weak::upgrade) {
            return lock;
        }
        table.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(RwLock::new(()));
        table.insert(path.clone(), Arc::downgrade(&lock));
        lock
    }

    pub async fn shared(&self, path: &VirtualPath) -> SharedGuard {
        self.lock_for(path).read_owned().await
    }

    pub async fn exclusive(&self, path: &VirtualPath) -> ExclusiveGuard {
        self.lock_for(path).write_owned().await
    }

    /// Exclusive guards on two paths, taken in a fixed order.
    pub async fn exclusive_pair(
        &self,
        a: &VirtualPath,
        b: &VirtualPath,
    ) -> (ExclusiveGuard, Option<ExclusiveGuard>) {
        if a == b {
            return (self.exclusive(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.exclusive(first).await;
        let g2 = self.exclusive(second).await;
        (g1, Some(g2))
    }

    pub fn tracked(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        table.values().filter(|w| w.strong_count() > 0).count()
    }
}
