use crate::types::{FlowNodeDefId, InstanceId, RefId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Resource guarded by a single-writer lock.
///
/// Nesting is only allowed in key order: a flow-node lock may be held while
/// gateway locks are taken, never the other way round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Process(InstanceId),
    FlowNode(InstanceId),
    /// The active instance of a gateway definition within one token scope.
    Gateway {
        scope: RefId,
        definition: FlowNodeDefId,
    },
}

pub type LockGuard = OwnedMutexGuard<()>;

/// Table of async mutexes keyed by [`LockKey`].
pub struct LockService {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
    prune_threshold: usize,
}

impl LockService {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            prune_threshold,
        }
    }

    fn entry(&self, key: LockKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > self.prune_threshold {
            // Only the table references an idle lock.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(key).or_default().clone()
    }

    pub async fn lock(&self, key: LockKey) -> LockGuard {
        self.entry(key).lock_owned().await
    }

    /// Take several locks in key order.
    pub async fn lock_many(&self, keys: impl IntoIterator<Item = LockKey>) -> Vec<LockGuard> {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new(1024)
    }
}
