//! Monitor Table Module
//!
//! Per-caller bookkeeping of outstanding lock instances, plus the liveness
//! watch that reports the caller's death back to its shard.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{CallerId, CallerRef, LockToken};

// == Monitor Entry ==
#[derive(Debug)]
struct MonitorEntry<K> {
    /// Task waiting for the caller to die
    watch: JoinHandle<()>,
    /// Lock instances attributed to the caller, with the key each belongs to
    instances: HashMap<LockToken, K>,
}

impl<K> Drop for MonitorEntry<K> {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

// == Monitor Table ==
/// Reference-counted liveness watches, one per caller with live instances.
///
/// An entry exists exactly while its caller owns or awaits at least one
/// lock instance on the shard; the watch is cancelled when the last
/// instance goes away.
#[derive(Debug)]
pub(crate) struct MonitorTable<K> {
    entries: HashMap<CallerId, MonitorEntry<K>>,
    /// Where watches report dead callers
    down: mpsc::UnboundedSender<CallerId>,
}

impl<K> MonitorTable<K> {
    pub(crate) fn new(down: mpsc::UnboundedSender<CallerId>) -> Self {
        Self {
            entries: HashMap::new(),
            down,
        }
    }

    // == Track ==
    /// Attributes `token` on `key` to `caller`, starting a watch if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn track(&mut self, caller: &CallerRef, token: LockToken, key: K) {
        let down = &self.down;
        let entry = self.entries.entry(caller.id()).or_insert_with(|| {
            let watched = caller.clone();
            let down = down.clone();
            MonitorEntry {
                watch: tokio::spawn(async move {
                    let id = watched.terminated().await;
                    let _ = down.send(id);
                }),
                instances: HashMap::new(),
            }
        });
        entry.instances.insert(token, key);
    }

    // == Forget ==
    /// Drops one instance; removes the entry when none remain.
    ///
    /// Unknown callers or tokens are ignored.
    pub(crate) fn forget(&mut self, caller: CallerId, token: LockToken) {
        let Some(entry) = self.entries.get_mut(&caller) else {
            return;
        };
        entry.instances.remove(&token);
        if entry.instances.is_empty() {
            self.entries.remove(&caller);
            trace!(%caller, "monitor removed");
        }
    }

    // == Take ==
    /// Removes a dead caller's entry and returns its instances.
    pub(crate) fn take(&mut self, caller: CallerId) -> Option<HashMap<LockToken, K>> {
        self.entries
            .remove(&caller)
            .map(|mut entry| std::mem::take(&mut entry.instances))
    }

    /// Number of instances currently attributed to `caller`.
    #[cfg(test)]
    pub(crate) fn ref_count(&self, caller: CallerId) -> usize {
        self.entries
            .get(&caller)
            .map_or(0, |entry| entry.instances.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Caller;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ref_counting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = MonitorTable::new(tx);
        let caller = Caller::new();

        table.track(&caller, LockToken::from_raw(1), "a");
        table.track(&caller, LockToken::from_raw(2), "b");
        assert_eq!(table.ref_count(caller.id()), 2);
        assert_eq!(table.len(), 1);

        table.forget(caller.id(), LockToken::from_raw(1));
        assert_eq!(table.ref_count(caller.id()), 1);

        // Repeated forget is a no-op
        table.forget(caller.id(), LockToken::from_raw(1));
        assert_eq!(table.ref_count(caller.id()), 1);

        table.forget(caller.id(), LockToken::from_raw(2));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_watch_reports_dead_caller() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = MonitorTable::new(tx);
        let caller = Caller::new();
        let id = caller.id();

        table.track(&caller, LockToken::from_raw(1), "a");
        drop(caller);

        let reported = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(reported, Some(id));

        let instances = table.take(id).unwrap();
        assert_eq!(instances.get(&LockToken::from_raw(1)), Some(&"a"));
        assert!(table.take(id).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_watch_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = MonitorTable::new(tx);
        let caller = Caller::new();

        table.track(&caller, LockToken::from_raw(1), "a");
        table.forget(caller.id(), LockToken::from_raw(1));
        tokio::task::yield_now().await;
        drop(caller);

        let reported = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(reported.is_err(), "aborted watch must not report");
    }
}
