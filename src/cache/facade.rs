//! Cache Facade Module
//!
//! Public cache operations. Each one decides whether to take the per-key
//! lock, reads or writes the store directly in the calling task, keeps the
//! expiry engine informed, and notifies the event listener.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::{CacheEvent, CacheStats, CacheStore, StatsRecorder};
use crate::config::{Config, StorageMode};
use crate::error::{CacheError, Result};
use crate::expiry::{ExpiryEngine, ExpiryStats, TtlUpdate};
use crate::lock::{Caller, CallerRef, LockGuard, LockKey, LockManager, LockStats};

/// Callback invoked for every [`CacheEvent`].
pub type EventListener<K, V> = Arc<dyn Fn(&CacheEvent<K, V>) + Send + Sync>;

/// Whether an operation goes through the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Isolation {
    Locked,
    Dirty,
}

/// A held per-key lock, plus the caller minted for it when the task had none.
///
/// Field order matters: the guard is released before the caller dies.
struct Held<K: LockKey> {
    _guard: LockGuard<K>,
    _caller: Option<Caller>,
}

#[derive(Debug, Clone)]
struct Options {
    default_ttl: Option<Duration>,
    lock_timeout: Option<Duration>,
    touch_on_read: bool,
    mode: StorageMode,
}

struct Shared<K: LockKey, V> {
    store: Arc<RwLock<CacheStore<K, V>>>,
    stats: Arc<StatsRecorder>,
    listener: Option<EventListener<K, V>>,
    locks: LockManager<K>,
    expiry: Option<ExpiryEngine<K>>,
    options: Options,
}

// == Cache ==
/// Concurrent key/value cache with per-key isolation and bucketed expiry.
///
/// Cloning is cheap; clones share the same storage, lock manager and
/// expiry engine.
pub struct Cache<K: LockKey, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K: LockKey, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: LockKey,
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates a cache from configuration.
    ///
    /// Spawns the lock shards and, unless the tick interval is zero, the
    /// expiry task, so it must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        Self::build(config, None)
    }

    /// Creates a cache that reports every change to `listener`.
    ///
    /// The listener runs in the task performing the change (the expiry task
    /// for `Expired` events) and must not block.
    pub fn with_listener<F>(config: &Config, listener: F) -> Self
    where
        F: Fn(&CacheEvent<K, V>) + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(listener)))
    }

    fn build(config: &Config, listener: Option<EventListener<K, V>>) -> Self {
        let store = Arc::new(RwLock::new(CacheStore::new(
            config.storage_mode,
            config.max_entries,
        )));
        let stats = Arc::new(StatsRecorder::new());

        let expiry = config.tick_interval().map(|interval| {
            let store = Arc::clone(&store);
            let stats = Arc::clone(&stats);
            let listener = listener.clone();

            let on_expire = move |key: K, sealed: u64| {
                let store = Arc::clone(&store);
                let stats = Arc::clone(&stats);
                let listener = listener.clone();
                async move {
                    purge_expired(&store, &stats, listener.as_ref(), key, sealed).await;
                }
            };
            let (engine, _task) = ExpiryEngine::spawn(interval, config.time_bits, on_expire);
            engine
        });

        info!(
            mode = ?config.storage_mode,
            shards = config.lock_shards,
            expiry = expiry.is_some(),
            "cache initialized"
        );

        Self {
            shared: Arc::new(Shared {
                store,
                stats,
                listener,
                locks: LockManager::with_shards(config.lock_shards),
                expiry,
                options: Options {
                    default_ttl: config.default_ttl(),
                    lock_timeout: config.lock_timeout(),
                    touch_on_read: config.touch_on_read,
                    mode: config.storage_mode,
                },
            }),
        }
    }

    // == Reads ==
    /// Returns the value under `key`. Never takes the key's lock.
    ///
    /// With touch-on-read enabled, a hit renews the key's TTL.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.require_single_value("get")?;
        let value = self.shared.store.read().await.get(key).cloned();
        self.record_read(key, value.is_some());
        Ok(value)
    }

    /// Returns every value under `key` (at most one outside bag mode).
    pub async fn get_all(&self, key: &K) -> Vec<V> {
        let values = self
            .shared
            .store
            .read()
            .await
            .get_all(key)
            .map(<[V]>::to_vec)
            .unwrap_or_default();
        self.record_read(key, !values.is_empty());
        values
    }

    pub async fn exists(&self, key: &K) -> bool {
        self.shared.store.read().await.contains(key)
    }

    pub async fn keys(&self) -> Vec<K> {
        self.shared.store.read().await.keys()
    }

    pub async fn size(&self) -> usize {
        self.shared.store.read().await.len()
    }

    // == Put ==
    /// Stores `value` under `key` while holding the key's lock.
    ///
    /// `ttl` of `None` applies the configured default TTL; a zero TTL means
    /// the key never expires. In bag mode the value is appended.
    pub async fn put(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
        self.put_with(key, value, ttl, Isolation::Locked).await
    }

    /// [`Cache::put`] without taking the key's lock.
    pub async fn dirty_put(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
        self.put_with(key, value, ttl, Isolation::Dirty).await
    }

    async fn put_with(
        &self,
        key: K,
        value: V,
        ttl: Option<Duration>,
        isolation: Isolation,
    ) -> Result<()> {
        let _held = self.isolate(&key, isolation).await?;
        let ttl = TtlUpdate::from_ttl(ttl.or(self.shared.options.default_ttl));
        self.write(key, value, ttl).await;
        Ok(())
    }

    // == Delete ==
    /// Removes `key` and its TTL. Returns whether it existed.
    pub async fn delete(&self, key: &K) -> Result<bool> {
        self.delete_with(key, Isolation::Locked).await
    }

    /// [`Cache::delete`] without taking the key's lock.
    pub async fn dirty_delete(&self, key: &K) -> Result<bool> {
        self.delete_with(key, Isolation::Dirty).await
    }

    async fn delete_with(&self, key: &K, isolation: Isolation) -> Result<bool> {
        let _held = self.isolate(key, isolation).await?;
        Ok(self.remove(key).await.is_some())
    }

    // == Take ==
    /// Removes `key` and returns its value.
    pub async fn take(&self, key: &K) -> Result<Option<V>> {
        self.take_with(key, Isolation::Locked).await
    }

    /// [`Cache::take`] without taking the key's lock.
    pub async fn dirty_take(&self, key: &K) -> Result<Option<V>> {
        self.take_with(key, Isolation::Dirty).await
    }

    async fn take_with(&self, key: &K, isolation: Isolation) -> Result<Option<V>> {
        self.require_single_value("take")?;
        let _held = self.isolate(key, isolation).await?;

        let value = self
            .remove(key)
            .await
            .and_then(|values| values.into_iter().next());
        if value.is_some() {
            self.shared.stats.record_hit();
        } else {
            self.shared.stats.record_miss();
        }
        Ok(value)
    }

    // == Update ==
    /// Replaces the value under `key` with `f(current)` while holding its lock.
    ///
    /// `Ok(value)` is stored and returned; `Err(reason)` leaves the entry
    /// untouched and is handed back as the inner error. Updating an existing
    /// key renews its TTL; a new key gets the default TTL.
    pub async fn update<F, E>(&self, key: K, f: F) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(Option<V>) -> std::result::Result<V, E>,
    {
        self.update_with(key, f, Isolation::Locked).await
    }

    /// [`Cache::update`] without taking the key's lock.
    pub async fn dirty_update<F, E>(&self, key: K, f: F) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(Option<V>) -> std::result::Result<V, E>,
    {
        self.update_with(key, f, Isolation::Dirty).await
    }

    async fn update_with<F, E>(
        &self,
        key: K,
        f: F,
        isolation: Isolation,
    ) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(Option<V>) -> std::result::Result<V, E>,
    {
        self.require_single_value("update")?;
        let _held = self.isolate(&key, isolation).await?;

        let current = self.shared.store.read().await.get(&key).cloned();
        let existed = current.is_some();
        Ok(self.commit(key, f(current), existed).await)
    }

    /// Like [`Cache::update`], but fails with `NotFound` if `key` is absent
    /// and never calls `f` in that case.
    pub async fn update_existing<F, E>(&self, key: K, f: F) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(V) -> std::result::Result<V, E>,
    {
        self.update_existing_with(key, f, Isolation::Locked).await
    }

    /// [`Cache::update_existing`] without taking the key's lock.
    pub async fn dirty_update_existing<F, E>(
        &self,
        key: K,
        f: F,
    ) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(V) -> std::result::Result<V, E>,
    {
        self.update_existing_with(key, f, Isolation::Dirty).await
    }

    async fn update_existing_with<F, E>(
        &self,
        key: K,
        f: F,
        isolation: Isolation,
    ) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce(V) -> std::result::Result<V, E>,
    {
        self.require_single_value("update_existing")?;
        let _held = self.isolate(&key, isolation).await?;

        let current = self.shared.store.read().await.get(&key).cloned();
        match current {
            Some(value) => Ok(self.commit(key, f(value), true).await),
            None => Err(CacheError::NotFound(format!("{:?}", key))),
        }
    }

    // == Fetch ==
    /// Returns the value under `key`, computing and storing it with `f` on a miss.
    ///
    /// Hits never take the lock; a miss takes it and checks again before
    /// calling `f`, so `f` runs at most once per missing key at a time.
    pub async fn get_or_store<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce() -> V,
    {
        let fetched = self
            .fetch_with(key, || Ok::<V, Infallible>(f()), Isolation::Locked)
            .await?;
        Ok(fetched.unwrap_or_else(|never| match never {}))
    }

    /// [`Cache::get_or_store`] without taking the key's lock on a miss.
    pub async fn dirty_get_or_store<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce() -> V,
    {
        let fetched = self
            .fetch_with(key, || Ok::<V, Infallible>(f()), Isolation::Dirty)
            .await?;
        Ok(fetched.unwrap_or_else(|never| match never {}))
    }

    /// Like [`Cache::get_or_store`] with a fallible loader; an `Err` from
    /// `f` stores nothing and is returned as the inner error.
    pub async fn fetch_or_store<F, E>(&self, key: K, f: F) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        self.fetch_with(key, f, Isolation::Locked).await
    }

    /// [`Cache::fetch_or_store`] without taking the key's lock on a miss.
    pub async fn dirty_fetch_or_store<F, E>(
        &self,
        key: K,
        f: F,
    ) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        self.fetch_with(key, f, Isolation::Dirty).await
    }

    async fn fetch_with<F, E>(
        &self,
        key: K,
        f: F,
        isolation: Isolation,
    ) -> Result<std::result::Result<V, E>>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        if let Some(value) = self.get(&key).await? {
            return Ok(Ok(value));
        }

        let _held = self.isolate(&key, isolation).await?;
        if let Some(value) = self.shared.store.read().await.get(&key).cloned() {
            return Ok(Ok(value));
        }

        match f() {
            Ok(value) => {
                let ttl = TtlUpdate::from_ttl(self.shared.options.default_ttl);
                self.write(key, value.clone(), ttl).await;
                Ok(Ok(value))
            }
            Err(reason) => Ok(Err(reason)),
        }
    }

    // == Isolated ==
    /// Runs `fut` while holding the lock on `key`.
    ///
    /// Inside `fut`, cache operations on `key` re-enter the lock instead of
    /// waiting for it. The lock is released when `fut` completes, panics or
    /// is dropped.
    pub async fn isolated<F>(&self, key: K, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        let timeout = self.shared.options.lock_timeout;

        if let Some(caller) = Caller::current() {
            let _guard = self.shared.locks.acquire(key, &caller, timeout).await?;
            return Ok(fut.await);
        }

        let caller = Caller::new();
        let view = CallerRef::clone(&caller);
        caller
            .scope(async move {
                let _guard = self.shared.locks.acquire(key, &view, timeout).await?;
                Ok::<_, CacheError>(fut.await)
            })
            .await
    }

    // == Expiry Control ==
    /// Time left before `key` expires; `None` for missing or persistent keys.
    pub async fn ttl(&self, key: &K) -> Result<Option<Duration>> {
        let Some(expiry) = &self.shared.expiry else {
            return Ok(None);
        };
        if !self.exists(key).await {
            return Ok(None);
        }
        expiry.ttl(key.clone()).await
    }

    /// Sets a new TTL on an existing key. Returns false if it is missing.
    pub async fn expire(&self, key: &K, ttl: Duration) -> Result<bool> {
        self.retime(key, TtlUpdate::from_ttl(Some(ttl))).await
    }

    /// Removes the TTL of an existing key. Returns false if it is missing.
    pub async fn persist(&self, key: &K) -> Result<bool> {
        self.retime(key, TtlUpdate::Never).await
    }

    /// Restarts an existing key's countdown from its last TTL.
    pub async fn touch(&self, key: &K) -> Result<bool> {
        self.retime(key, TtlUpdate::Renew).await
    }

    async fn retime(&self, key: &K, update: TtlUpdate) -> Result<bool> {
        let _held = self.isolate(key, Isolation::Locked).await?;

        let mut store = self.shared.store.write().await;
        if !store.contains(key) {
            return Ok(false);
        }
        if let Some(stamp) = self.set_ttl(key.clone(), update) {
            store.stamp(key, stamp);
        }
        Ok(true)
    }

    // == Clear ==
    /// Removes every entry without taking any key lock. Returns the count.
    pub async fn clear(&self) -> usize {
        let removed = {
            let mut store = self.shared.store.write().await;
            if store.is_empty() {
                return 0;
            }
            store.clear()
        };
        for key in &removed {
            self.set_ttl(key.clone(), TtlUpdate::Never);
            self.shared.stats.record_delete();
            self.emit(|| CacheEvent::Delete { key: key.clone() });
        }
        debug!("cache cleared: {} keys removed", removed.len());
        removed.len()
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let total_entries = self.size().await;
        self.shared.stats.snapshot(total_entries)
    }

    pub async fn lock_stats(&self) -> Result<LockStats> {
        self.shared.locks.stats().await
    }

    /// Expiry engine statistics, or `None` when expiry is disabled.
    pub async fn expiry_stats(&self) -> Result<Option<ExpiryStats>> {
        match &self.shared.expiry {
            Some(expiry) => expiry.stats().await.map(Some),
            None => Ok(None),
        }
    }

    /// The cache's lock manager, for callers that lock keys directly.
    pub fn locks(&self) -> &LockManager<K> {
        &self.shared.locks
    }

    pub fn mode(&self) -> StorageMode {
        self.shared.options.mode
    }

    // == Internals ==
    async fn isolate(&self, key: &K, isolation: Isolation) -> Result<Option<Held<K>>> {
        if isolation == Isolation::Dirty {
            return Ok(None);
        }

        let (caller, owned) = match Caller::current() {
            Some(caller) => (caller, None),
            None => {
                let owned = Caller::new();
                (CallerRef::clone(&owned), Some(owned))
            }
        };

        let guard = self
            .shared
            .locks
            .acquire(key.clone(), &caller, self.shared.options.lock_timeout)
            .await?;

        Ok(Some(Held {
            _guard: guard,
            _caller: owned,
        }))
    }

    /// Writes a value. The TTL update is queued before the store write so a
    /// tick landing in between cannot purge the fresh value under an old TTL.
    /// The entry carries the update's stamp, which keeps it safe from a
    /// purge the expiry task decided on before the update was applied.
    async fn write(&self, key: K, value: V, ttl: TtlUpdate) {
        let stamp = self.set_ttl(key.clone(), ttl);

        let event = self.shared.listener.as_ref().map(|_| CacheEvent::Put {
            key: key.clone(),
            value: value.clone(),
        });
        let evicted = {
            let mut store = self.shared.store.write().await;
            let evicted = store.insert(key.clone(), value);
            if let Some(stamp) = stamp {
                store.stamp(&key, stamp);
            }
            evicted
        };
        self.shared.stats.record_write();

        if let Some(evicted) = evicted {
            debug!(key = ?evicted, "evicted least recently written key");
            self.set_ttl(evicted.clone(), TtlUpdate::Never);
            self.shared.stats.record_eviction();
            self.emit(|| CacheEvent::Evicted { key: evicted });
        }
        if let Some(event) = event {
            self.emit(|| event);
        }
    }

    /// Stores the outcome of an update function.
    async fn commit<E>(
        &self,
        key: K,
        outcome: std::result::Result<V, E>,
        existed: bool,
    ) -> std::result::Result<V, E> {
        let value = outcome?;
        let ttl = if existed {
            TtlUpdate::Renew
        } else {
            TtlUpdate::from_ttl(self.shared.options.default_ttl)
        };
        self.write(key, value.clone(), ttl).await;
        Ok(value)
    }

    async fn remove(&self, key: &K) -> Option<Vec<V>> {
        let removed = self.shared.store.write().await.remove(key);
        if removed.is_some() {
            self.set_ttl(key.clone(), TtlUpdate::Never);
            self.shared.stats.record_delete();
            self.emit(|| CacheEvent::Delete { key: key.clone() });
        }
        removed
    }

    fn record_read(&self, key: &K, hit: bool) {
        if !hit {
            self.shared.stats.record_miss();
            return;
        }
        self.shared.stats.record_hit();
        if self.shared.options.touch_on_read {
            self.set_ttl(key.clone(), TtlUpdate::Renew);
        }
    }

    /// Queues a TTL update and returns its stamp, if expiry is enabled.
    fn set_ttl(&self, key: K, update: TtlUpdate) -> Option<u64> {
        self.shared
            .expiry
            .as_ref()
            .map(|expiry| expiry.set_ttl(key, update))
    }

    fn emit(&self, event: impl FnOnce() -> CacheEvent<K, V>) {
        if let Some(listener) = &self.shared.listener {
            listener(&event());
        }
    }

    fn require_single_value(&self, operation: &str) -> Result<()> {
        if self.shared.options.mode == StorageMode::Bag {
            return Err(CacheError::Unsupported(format!(
                "{} needs a single value per key, but the cache stores bags",
                operation
            )));
        }
        Ok(())
    }
}

// == Counters ==
impl<K: LockKey> Cache<K, i64> {
    /// Adds `by` to the integer under `key` (missing keys count as zero).
    pub async fn incr(&self, key: K, by: i64) -> Result<i64> {
        self.update(key, |current| add(current, by)).await?
    }

    /// [`Cache::incr`] without taking the key's lock.
    pub async fn dirty_incr(&self, key: K, by: i64) -> Result<i64> {
        self.dirty_update(key, |current| add(current, by)).await?
    }
}

fn add(current: Option<i64>, by: i64) -> Result<i64> {
    current
        .unwrap_or(0)
        .checked_add(by)
        .ok_or_else(|| CacheError::InvalidRequest("integer overflow".to_string()))
}

/// Deletes an expired key unless it was rewritten after `sealed`.
async fn purge_expired<K, V>(
    store: &RwLock<CacheStore<K, V>>,
    stats: &StatsRecorder,
    listener: Option<&EventListener<K, V>>,
    key: K,
    sealed: u64,
) where
    K: LockKey,
    V: Clone,
{
    if store.write().await.expire(&key, sealed).is_none() {
        return;
    }
    stats.record_expiration();
    if let Some(listener) = listener {
        listener(&CacheEvent::Expired { key });
    }
}
