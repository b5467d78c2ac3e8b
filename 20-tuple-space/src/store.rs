//! Per-replica tuple storage.
//!
//! One `TupleStore` backs one replica. All operations run inside the store's
//! critical section, so PUT, READ, TAKE and the lock operations are totally
//! ordered on a replica. Blocking operations park on a `Notify` that every
//! PUT fires; they re-scan the space after each wake-up.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::ClientId;
use crate::tuple::Pattern;

/// Ownership of one stored tuple, as seen by the TAKE locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    OwnedBy(ClientId),
}

/// A stored tuple and its lock entry. Removing the tuple removes the lock.
#[derive(Debug, Clone)]
struct Entry {
    tuple: String,
    lock: LockState,
}

/// Thread-safe tuple space for a single replica.
///
/// Tuples are kept in insertion order and duplicates are allowed. Matching
/// scans in that order, so the first inserted matching tuple wins.
#[derive(Default)]
pub struct TupleStore {
    entries: Mutex<Vec<Entry>>,
    added: Notify,
}

impl TupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tuple` and wakes every blocked READ, TAKE and lock request.
    pub fn put(&self, tuple: impl Into<String>) {
        let tuple = tuple.into();
        debug!(%tuple, "tuple added");
        self.entries().push(Entry {
            tuple,
            lock: LockState::Free,
        });
        self.added.notify_waiters();
    }

    /// Returns the first tuple matching `pattern` without removing it.
    ///
    /// Waits for a PUT if nothing matches yet. There is no built-in timeout.
    pub async fn read(&self, pattern: &Pattern) -> String {
        self.wait_for(|entries| {
            entries
                .iter()
                .find(|entry| pattern.matches(&entry.tuple))
                .map(|entry| entry.tuple.clone())
        })
        .await
    }

    /// Like [`TupleStore::read`], but removes the matched tuple in the same
    /// critical section.
    pub async fn take(&self, pattern: &Pattern) -> String {
        self.wait_for(|entries| {
            let index = entries
                .iter()
                .position(|entry| pattern.matches(&entry.tuple))?;
            Some(entries.remove(index).tuple)
        })
        .await
    }

    /// Copy of the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|entry| entry.tuple.clone())
            .collect()
    }

    /// Every tuple with its lock entry, in insertion order.
    pub fn lock_table(&self) -> Vec<(String, LockState)> {
        self.entries()
            .iter()
            .map(|entry| (entry.tuple.clone(), entry.lock))
            .collect()
    }

    /// Reserves every matching tuple that is free or already owned by `client`.
    ///
    /// Matches owned by other clients are left alone. Returns at once when
    /// something was claimed or a match was contested; an empty result then
    /// means "contended, try again". Blocks only while no tuple matches at all.
    pub async fn acquire_lock(&self, client: ClientId, pattern: &Pattern) -> Vec<String> {
        self.wait_for(|entries| {
            let mut claimed = Vec::new();
            let mut contested = false;
            for entry in entries
                .iter_mut()
                .filter(|entry| pattern.matches(&entry.tuple))
            {
                match entry.lock {
                    LockState::Free => {
                        entry.lock = LockState::OwnedBy(client);
                        claimed.push(entry.tuple.clone());
                    }
                    LockState::OwnedBy(owner) if owner == client => {
                        claimed.push(entry.tuple.clone());
                    }
                    LockState::OwnedBy(owner) => {
                        debug!(client, owner, tuple = %entry.tuple, "lock denied");
                        contested = true;
                    }
                }
            }

            if claimed.is_empty() && !contested {
                debug!(client, %pattern, "no matching tuple, waiting for a put");
                return None;
            }
            debug!(client, ?claimed, contested, "lock request answered");
            Some(claimed)
        })
        .await
    }

    /// Frees every tuple owned by `client`. Returns how many were freed.
    pub fn release_lock(&self, client: ClientId) -> usize {
        let mut released = 0;
        for entry in self.entries().iter_mut() {
            if entry.lock == LockState::OwnedBy(client) {
                entry.lock = LockState::Free;
                released += 1;
            }
        }
        debug!(client, released, "locks released");
        released
    }

    /// Runs `probe` under the lock until it yields a value.
    ///
    /// The `Notified` future is enabled before probing, so a PUT landing
    /// between the probe and the await still wakes us.
    async fn wait_for<T>(&self, mut probe: impl FnMut(&mut Vec<Entry>) -> Option<T>) -> T {
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = {
                let mut entries = self.entries();
                probe(&mut entries)
            };
            if let Some(found) = found {
                return found;
            }
            notified.await;
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
