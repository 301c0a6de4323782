//! Lock Module
//!
//! Per-key mutual exclusion. Unrelated keys proceed independently while
//! operations on the same key are serialized, with reentrancy for the owning
//! caller, FIFO hand-off to waiters, and automatic release of locks held or
//! awaited by callers that terminate.
//!
//! The manager only arbitrates ownership: critical sections run in the
//! caller's own task while it holds a [`LockGuard`].

mod caller;
mod manager;
mod monitor;
mod resource;

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{CacheError, Result};
use manager::{Command, LockShard};

pub use caller::{Caller, CallerId, CallerRef};

static NEXT_LOCK_TOKEN: AtomicU64 = AtomicU64::new(1);

// == Lock Key ==
/// Anything usable as a lock id.
pub trait LockKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

// == Lock Token ==
/// Unique identifier minted per acquire call.
///
/// Releases are attributed by token rather than by caller, so overlapping
/// acquisitions of one key by the same caller are released independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(u64);

impl LockToken {
    fn next() -> Self {
        Self(NEXT_LOCK_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

// == Introspection ==
/// Snapshot of one key's lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    /// Current owner
    pub owner: Option<CallerId>,
    /// Nested acquisitions held by the owner
    pub hold_count: usize,
    /// Number of queued acquire requests
    pub waiting: usize,
}

/// Lock manager bookkeeping sizes, summed across shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Keys currently owned or awaited
    pub resources: usize,
    /// Callers currently being watched
    pub monitors: usize,
}

// == Lock Guard ==
/// Proof of ownership of one lock instance.
///
/// Dropping the guard releases the instance, so the lock is returned on
/// every exit path of the critical section, panics included.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<K: LockKey> {
    key: K,
    caller: CallerId,
    token: LockToken,
    shard: mpsc::UnboundedSender<Command<K>>,
    armed: bool,
}

impl<K: LockKey> LockGuard<K> {
    fn new(
        key: K,
        caller: CallerId,
        token: LockToken,
        shard: mpsc::UnboundedSender<Command<K>>,
    ) -> Self {
        Self {
            key,
            caller,
            token,
            shard,
            armed: true,
        }
    }

    /// The locked key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The caller owning this instance.
    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// The token identifying this acquisition.
    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Releases the lock now.
    pub fn release(self) {
        drop(self);
    }

    /// Disarms the guard, leaving the release to the caller.
    ///
    /// The instance must then be released with [`LockManager::release`], or
    /// it is released when the owning caller terminates.
    pub fn into_token(mut self) -> LockToken {
        self.armed = false;
        self.token
    }
}

impl<K: LockKey> Drop for LockGuard<K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self.shard.send(Command::Release {
            key: self.key.clone(),
            caller: self.caller,
            token: self.token,
        });
    }
}

// == Lock Manager ==
/// Handle to a pool of lock shards; keys are routed to a shard by hash.
///
/// Cloning the handle is cheap and shares the same shards. The shards run
/// until the last handle and the last guard are dropped.
#[derive(Debug)]
pub struct LockManager<K: LockKey> {
    shards: Arc<[mpsc::UnboundedSender<Command<K>>]>,
}

impl<K: LockKey> Clone for LockManager<K> {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
        }
    }
}

impl<K: LockKey> LockManager<K> {
    // == Constructor ==
    /// Creates a manager with a single shard.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    /// Creates a manager with `count` shards (at least one).
    pub fn with_shards(count: usize) -> Self {
        let shards: Vec<_> = (0..count.max(1))
            .map(|index| LockShard::spawn(index).0)
            .collect();
        Self {
            shards: shards.into(),
        }
    }

    fn shard_for(&self, key: &K) -> &mpsc::UnboundedSender<Command<K>> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    fn send(&self, shard: &mpsc::UnboundedSender<Command<K>>, command: Command<K>) -> Result<()> {
        shard.send(command).map_err(|_| stopped())
    }

    // == Acquire ==
    /// Waits until `caller` owns `key`, or until `timeout` elapses.
    ///
    /// `None` waits forever. Re-acquiring a key the caller already owns
    /// succeeds immediately. On timeout the request is withdrawn, and a
    /// grant that raced the timeout is released again.
    pub async fn acquire(
        &self,
        key: K,
        caller: &CallerRef,
        timeout: Option<Duration>,
    ) -> Result<LockGuard<K>> {
        let shard = self.shard_for(&key);
        let token = LockToken::next();
        let (reply, granted) = oneshot::channel();

        self.send(
            shard,
            Command::Acquire {
                key: key.clone(),
                caller: caller.clone(),
                token,
                reply,
            },
        )?;

        // Armed before waiting: dropping this future or timing out withdraws
        // the request through the guard.
        let guard = LockGuard::new(key, caller.id(), token, shard.clone());

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, granted).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(caller = %guard.caller(), key = ?guard.key(), "lock acquire timed out");
                    return Err(CacheError::LockTimeout(format!("{:?}", guard.key())));
                }
            },
            None => granted.await,
        };

        if outcome.is_err() {
            // Shards drop the reply of a waiter whose caller died.
            if !caller.is_alive() {
                return Err(CacheError::CallerTerminated(guard.caller().to_string()));
            }
            return Err(stopped());
        }
        Ok(guard)
    }

    // == Try Acquire ==
    /// Takes `key` only if it is free (or already owned by `caller`).
    ///
    /// Contention yields `Ok(None)`; the request is never queued.
    pub async fn try_acquire(&self, key: K, caller: &CallerRef) -> Result<Option<LockGuard<K>>> {
        let shard = self.shard_for(&key);
        let token = LockToken::next();
        let (reply, answer) = oneshot::channel();

        self.send(
            shard,
            Command::TryAcquire {
                key: key.clone(),
                caller: caller.clone(),
                token,
                reply,
            },
        )?;

        let granted = answer
            .await
            .map_err(|_| stopped())?;

        Ok(granted.then(|| LockGuard::new(key, caller.id(), token, shard.clone())))
    }

    // == Release ==
    /// Releases the instance `token` of `key` held or awaited by `caller`.
    ///
    /// Unknown or repeated releases are ignored.
    pub fn release(&self, key: K, caller: CallerId, token: LockToken) {
        let shard = self.shard_for(&key);
        let _ = shard.send(Command::Release { key, caller, token });
    }

    // == Inspect ==
    /// Returns the lock state of `key`, or `None` when nobody holds or awaits it.
    pub async fn inspect(&self, key: K) -> Result<Option<LockInfo>> {
        let shard = self.shard_for(&key);
        let (reply, answer) = oneshot::channel();
        self.send(shard, Command::Inspect { key, reply })?;
        answer
            .await
            .map_err(|_| stopped())
    }

    // == Stats ==
    /// Returns bookkeeping sizes summed across shards.
    pub async fn stats(&self) -> Result<LockStats> {
        let mut total = LockStats::default();
        for shard in self.shards.iter() {
            let (reply, answer) = oneshot::channel();
            self.send(shard, Command::Stats { reply })?;
            let stats = answer
                .await
                .map_err(|_| stopped())?;
            total.resources += stats.resources;
            total.monitors += stats.monitors;
        }
        Ok(total)
    }
}

impl<K: LockKey> Default for LockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn stopped() -> CacheError {
    CacheError::Unavailable("lock manager stopped".to_string())
}
