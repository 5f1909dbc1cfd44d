use crate::{
    sync::Mutex,
    types::{FixedSizeKey, HashSet},
};
use core::{fmt, hash::BuildHasher, num::NonZeroUsize};
use log::trace;
use rustc_hash::FxBuildHasher;

/// Registry of advisory locks over [`FixedSizeKey`]s.
///
/// A key is locked iff it is present in the registry. Locking is an atomic
/// test-and-set that never waits: contention is reported as `false` and the
/// caller decides whether to retry, poll or reject.
///
/// The registry tracks key values, not owners. Any caller holding the same
/// key may unlock it, so the acquirer must be the only releaser by
/// convention. [`lock_guard`](Self::lock_guard) makes that convention
/// structural.
///
/// By default the whole keyspace sits behind a single mutex.
/// [`with_shards`](Self::with_shards) partitions it by key hash into
/// independently locked shards with the same per-key contract.
pub struct KeyRegistry {
    shards: Box<[Mutex<HashSet<FixedSizeKey>>]>,
}

impl KeyRegistry {
    /// An empty registry guarded by one mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(NonZeroUsize::MIN)
    }

    /// An empty registry split into `shards` independently locked partitions.
    #[must_use]
    pub fn with_shards(shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| Mutex::new(HashSet::default()))
            .collect();
        Self { shards }
    }

    /// Lock `key` if it is free.
    ///
    /// Returns `true` if the key was acquired by this call and `false` if it
    /// was already locked.
    pub fn try_lock(&self, key: impl Into<FixedSizeKey>) -> bool {
        let key = key.into();
        let acquired = self.shard(&key).lock().insert(key);
        trace!("try_lock {key:?}: {}", if acquired { "acquired" } else { "busy" });
        acquired
    }

    /// Unlock `key`. Unlocking a free key is a no-op.
    pub fn unlock(&self, key: impl Into<FixedSizeKey>) {
        let key = key.into();
        if self.shard(&key).lock().remove(&key) {
            trace!("unlock {key:?}");
        }
    }

    /// Lock `key` and return a guard that unlocks it when dropped.
    #[must_use]
    pub fn lock_guard(&self, key: impl Into<FixedSizeKey>) -> Option<KeyGuard<'_>> {
        let key = key.into();
        self.try_lock(key).then(|| KeyGuard {
            registry: self,
            key,
        })
    }

    /// Whether `key` is currently locked.
    ///
    /// The answer may be stale by the time the caller acts on it.
    #[must_use]
    pub fn is_locked(&self, key: impl Into<FixedSizeKey>) -> bool {
        let key = key.into();
        self.shard(&key).lock().contains(&key)
    }

    /// Number of locked keys, summed shard by shard.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Whether no key is locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    fn shard(&self, key: &FixedSizeKey) -> &Mutex<HashSet<FixedSizeKey>> {
        match &*self.shards {
            [single] => single,
            shards => {
                let idx = FxBuildHasher.hash_one(key) as usize % shards.len();
                &shards[idx]
            }
        }
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("shards", &self.shards.len())
            .field("locked", &self.len())
            .finish()
    }
}

/// Holds a key locked in a [`KeyRegistry`] until dropped.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeyGuard<'a> {
    registry: &'a KeyRegistry,
    key: FixedSizeKey,
}

impl KeyGuard<'_> {
    /// The locked key.
    pub fn key(&self) -> FixedSizeKey {
        self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.registry.unlock(self.key);
    }
}
