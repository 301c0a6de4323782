//! Expiry Wheel Module
//!
//! Discrete-time bookkeeping of key expiry. Time advances in ticks of a
//! fixed interval; each tracked key sits in exactly one future bucket and
//! every key in the current bucket is due.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

// == TTL Update ==
/// A requested change to a key's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUpdate {
    /// Expire after the given duration (zero is treated as `Never`)
    After(Duration),
    /// Reapply the key's last known TTL
    Renew,
    /// Stop tracking the key; the entry itself is left alone
    Never,
}

impl TtlUpdate {
    /// Maps an optional TTL to an update; `None` and zero mean `Never`.
    pub fn from_ttl(ttl: Option<Duration>) -> Self {
        match ttl {
            Some(ttl) if !ttl.is_zero() => TtlUpdate::After(ttl),
            _ => TtlUpdate::Never,
        }
    }
}

// == Expiry Record ==
/// Where a tracked key is due, and the TTL that put it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryRecord {
    /// Virtual tick at which the key is purged
    pub bucket: u64,
    /// Raw TTL last applied
    pub ttl: Duration,
}

// == Expiry Stats ==
/// Snapshot of the wheel's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryStats {
    /// Current virtual time
    pub now: u64,
    /// Virtual time at which the clock wraps
    pub horizon: u64,
    /// Keys with a finite TTL
    pub tracked: usize,
    /// Updates waiting for the next tick
    pub queued: usize,
    /// Keys purged since start
    pub expired_total: u64,
}

// == Expiry Wheel ==
/// Bucketed expiry schedule.
///
/// `ttls` and `pending` mirror each other: a key is in `pending[b]` iff
/// `ttls[key].bucket == b`.
#[derive(Debug)]
pub struct ExpiryWheel<K> {
    interval: Duration,
    horizon: u64,
    now: u64,
    ttls: HashMap<K, ExpiryRecord>,
    pending: HashMap<u64, HashSet<K>>,
    /// Updates batched until the next tick, coalesced per key
    queued: HashMap<K, TtlUpdate>,
    /// TTLs of the keys purged by the last tick, so a `Renew` racing the
    /// purge can still find them
    recently_expired: HashMap<K, Duration>,
    expired_total: u64,
}

impl<K: Eq + Hash + Clone> ExpiryWheel<K> {
    // == Constructor ==
    /// Creates a wheel ticking every `interval`, wrapping after `2^time_bits` ticks.
    ///
    /// # Arguments
    /// * `interval` - Tick interval; must be non-zero
    /// * `time_bits` - Clock width, clamped to 1..=32
    pub fn new(interval: Duration, time_bits: u32) -> Self {
        Self {
            interval: interval.max(Duration::from_nanos(1)),
            horizon: 1u64 << time_bits.clamp(1, 32),
            now: 0,
            ttls: HashMap::new(),
            pending: HashMap::new(),
            queued: HashMap::new(),
            recently_expired: HashMap::new(),
            expired_total: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    // == Queue ==
    /// Batches an update for the next tick.
    ///
    /// A later explicit update replaces an earlier one; a `Renew` never
    /// overrides an update already waiting, since it would reapply it anyway.
    pub fn queue(&mut self, key: K, update: TtlUpdate) {
        match update {
            TtlUpdate::Renew => {
                self.queued.entry(key).or_insert(TtlUpdate::Renew);
            }
            _ => {
                self.queued.insert(key, update);
            }
        }
    }

    // == Tick ==
    /// Runs one tick and returns the keys that expired.
    ///
    /// Applies batched updates, advances the clock, then empties the bucket
    /// for the new current time.
    pub fn tick(&mut self) -> Vec<K> {
        let queued = std::mem::take(&mut self.queued);
        for (key, update) in queued {
            self.apply(key, update);
        }
        self.recently_expired.clear();

        self.advance();
        self.purge()
    }

    // == Remaining ==
    /// Time left before `key` is purged, counting batched updates.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let record = match self.queued.get(key) {
            Some(TtlUpdate::After(ttl)) => return (!ttl.is_zero()).then_some(*ttl),
            Some(TtlUpdate::Never) => return None,
            Some(TtlUpdate::Renew) => return self.last_ttl(key),
            None => self.record(key)?,
        };

        let ticks = record.bucket.saturating_sub(self.now);
        Some(
            self.interval
                .saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX)),
        )
    }

    /// Returns the applied record for `key`.
    pub fn record(&self, key: &K) -> Option<ExpiryRecord> {
        self.ttls.get(key).copied()
    }

    pub fn stats(&self) -> ExpiryStats {
        ExpiryStats {
            now: self.now,
            horizon: self.horizon,
            tracked: self.ttls.len(),
            queued: self.queued.len(),
            expired_total: self.expired_total,
        }
    }

    fn apply(&mut self, key: K, update: TtlUpdate) {
        let ttl = match update {
            TtlUpdate::After(ttl) => ttl,
            TtlUpdate::Renew => match self.last_ttl(&key) {
                Some(ttl) => ttl,
                None => return,
            },
            TtlUpdate::Never => Duration::ZERO,
        };

        self.untrack(&key);
        if ttl.is_zero() {
            return;
        }

        let bucket = self.now + 1 + self.buckets_for(ttl);
        self.pending.entry(bucket).or_default().insert(key.clone());
        self.ttls.insert(key, ExpiryRecord { bucket, ttl });
    }

    /// The TTL a `Renew` reapplies: the tracked one, else the one the key
    /// had when the last tick purged it.
    fn last_ttl(&self, key: &K) -> Option<Duration> {
        self.ttls
            .get(key)
            .map(|record| record.ttl)
            .or_else(|| self.recently_expired.get(key).copied())
    }

    fn untrack(&mut self, key: &K) {
        let Some(record) = self.ttls.remove(key) else {
            return;
        };
        if let Some(keys) = self.pending.get_mut(&record.bucket) {
            keys.remove(key);
            if keys.is_empty() {
                self.pending.remove(&record.bucket);
            }
        }
    }

    /// Whole ticks covering `ttl`, rounded up so nothing expires early.
    fn buckets_for(&self, ttl: Duration) -> u64 {
        let ticks = ttl.as_nanos().div_ceil(self.interval.as_nanos());
        u64::try_from(ticks).unwrap_or(u64::MAX).min(u64::MAX / 4)
    }

    fn advance(&mut self) {
        if self.now + 1 < self.horizon {
            self.now += 1;
            return;
        }

        // Wrap: rebase every bucket so the next tick becomes zero.
        let shift = self.now + 1;
        for record in self.ttls.values_mut() {
            record.bucket = record.bucket.saturating_sub(shift);
        }
        self.pending = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(bucket, keys)| (bucket.saturating_sub(shift), keys))
            .collect();
        self.now = 0;
    }

    fn purge(&mut self) -> Vec<K> {
        let Some(keys) = self.pending.remove(&self.now) else {
            return Vec::new();
        };
        for key in &keys {
            if let Some(record) = self.ttls.remove(key) {
                self.recently_expired.insert(key.clone(), record.ttl);
            }
        }
        self.expired_total += keys.len() as u64;
        keys.into_iter().collect()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let mirrored = self.ttls.iter().all(|(key, record)| {
            self.pending
                .get(&record.bucket)
                .is_some_and(|keys| keys.contains(key))
        });
        let counted: usize = self.pending.values().map(HashSet::len).sum();
        mirrored && counted == self.ttls.len() && self.pending.values().all(|k| !k.is_empty())
    }
}
