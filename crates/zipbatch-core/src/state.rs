//! Per-user conversation state with per-key locking.
//!
//! Each key owns its own async mutex, so two overlapping requests from the same
//! user serialise while different users never contend.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type StateGuard<S> = OwnedMutexGuard<Option<S>>;

pub struct StateStore<K, S> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<Option<S>>>>>,
}

impl<K, S> Default for StateStore<K, S> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, S> StateStore<K, S>
where
    K: Eq + Hash + Clone,
    S: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<Option<S>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Exclusive access to `key`'s state until the guard drops.
    pub async fn lock(&self, key: &K) -> StateGuard<S> {
        self.slot(key).lock_owned().await
    }

    /// Like [`Self::lock`] but returns `None` if another request holds the key.
    pub fn try_lock(&self, key: &K) -> Option<StateGuard<S>> {
        self.slot(key).try_lock_owned().ok()
    }

    pub async fn get(&self, key: &K) -> Option<S> {
        let state = self.lock(key).await.clone();
        if state.is_none() {
            self.prune(key);
        }
        state
    }

    pub async fn set(&self, key: &K, state: S) {
        *self.lock(key).await = Some(state);
    }

    pub async fn take(&self, key: &K) -> Option<S> {
        let taken = self.lock(key).await.take();
        self.prune(key);
        taken
    }

    /// Drop `key`'s slot if it holds no state and nobody has it locked.
    ///
    /// Slots are handed out under the map lock, so a strong count of one means
    /// no guard or waiter can reach it.
    pub fn prune(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let idle = slots.get(key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|state| state.is_none())
        });
        if idle {
            slots.remove(key);
        }
    }

    /// Number of keys that currently have a slot.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the state only if it currently equals `expected`.
    ///
    /// On mismatch the current state is returned unchanged.
    pub async fn compare_and_swap(
        &self,
        key: &K,
        expected: &Option<S>,
        new: Option<S>,
    ) -> Result<(), Option<S>>
    where
        S: PartialEq,
    {
        let mut guard = self.lock(key).await;
        if *guard != *expected {
            return Err(guard.clone());
        }
        let cleared = new.is_none();
        *guard = new;
        drop(guard);
        if cleared {
            self.prune(key);
        }
        Ok(())
    }
}
