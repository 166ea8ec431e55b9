use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// Table of async mutexes keyed by value.
///
/// Holders of different keys never wait on each other. A slot lives only while
/// someone holds or waits for it, so the table does not grow with the number of
/// keys ever locked.
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    slots: Slots<K>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Waits until `key` is free and returns a guard holding it.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let guard = PendingLock {
            acquire: Some(self.slot(&key).lock_owned().boxed()),
            key: &key,
            slots: &self.slots,
        }
        .await;
        KeyGuard {
            key,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Returns a guard if `key` is currently free.
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<K>> {
        let slot = self.slot(&key);
        match slot.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                key,
                guard: Some(guard),
                slots: Arc::clone(&self.slots),
            }),
            Err(_) => {
                // the holder may have let go in the meantime
                prune(&self.slots, &key);
                None
            }
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("active", &self.slots.len())
            .finish()
    }
}

/// Exclusive hold on one key of a [`KeyedLocks`] table. Released on drop.
pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots<K>,
}

impl<K> KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> fmt::Debug for KeyGuard<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.guard.take();
        prune(&self.slots, &self.key);
    }
}

/// A waiter queued on a slot. Dropping it before the lock is granted lets go
/// of the slot and prunes it, so a cancelled waiter leaves nothing behind.
struct PendingLock<'a, K>
where
    K: Eq + Hash + Clone,
{
    acquire: Option<BoxFuture<'static, OwnedMutexGuard<()>>>,
    key: &'a K,
    slots: &'a Slots<K>,
}

impl<K> Future for PendingLock<'_, K>
where
    K: Eq + Hash + Clone,
{
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let acquire = self
            .acquire
            .as_mut()
            .expect("PendingLock polled after completion");
        let guard = futures::ready!(acquire.poll_unpin(cx));
        self.acquire = None;
        Poll::Ready(guard)
    }
}

impl<K> Drop for PendingLock<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // the acquire future owns a handle to the slot; release it first
        if self.acquire.take().is_some() {
            prune(self.slots, self.key);
        }
    }
}

/// Drops the slot for `key` when the table holds the only reference to it.
/// `remove_if` runs under the shard lock, so no other task can clone the slot
/// between the count check and the removal.
fn prune<K>(slots: &DashMap<K, Arc<Mutex<()>>>, key: &K)
where
    K: Eq + Hash + Clone,
{
    slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
}
