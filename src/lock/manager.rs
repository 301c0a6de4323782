//! Lock Shard Actor
//!
//! One shard of the lock manager: a tokio task that owns the key to
//! [`Resource`] map and the [`MonitorTable`] of its callers, and applies
//! commands one at a time.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::monitor::MonitorTable;
use super::resource::{Dropped, Resource, Waiter};
use super::{CallerId, CallerRef, LockInfo, LockKey, LockStats, LockToken};

// == Commands ==
/// Messages accepted by a shard.
#[derive(Debug)]
pub(crate) enum Command<K> {
    Acquire {
        key: K,
        caller: CallerRef,
        token: LockToken,
        reply: oneshot::Sender<()>,
    },
    TryAcquire {
        key: K,
        caller: CallerRef,
        token: LockToken,
        reply: oneshot::Sender<bool>,
    },
    Release {
        key: K,
        caller: CallerId,
        token: LockToken,
    },
    Inspect {
        key: K,
        reply: oneshot::Sender<Option<LockInfo>>,
    },
    Stats {
        reply: oneshot::Sender<LockStats>,
    },
}

// == Lock Shard ==
pub(crate) struct LockShard<K> {
    index: usize,
    resources: HashMap<K, Resource>,
    monitors: MonitorTable<K>,
}

impl<K: LockKey> LockShard<K> {
    /// Spawns shard `index` and returns its command sender.
    ///
    /// The shard stops once every sender (manager handles and live guards)
    /// has been dropped.
    pub(crate) fn spawn(index: usize) -> (mpsc::UnboundedSender<Command<K>>, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = mpsc::unbounded_channel();

        let shard = Self {
            index,
            resources: HashMap::new(),
            monitors: MonitorTable::new(down_tx),
        };
        let handle = tokio::spawn(shard.run(commands_rx, down_rx));

        (commands_tx, handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<K>>,
        mut downs: mpsc::UnboundedReceiver<CallerId>,
    ) {
        debug!(shard = self.index, "lock shard started");

        loop {
            tokio::select! {
                biased;
                Some(caller) = downs.recv() => self.caller_down(caller),
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        debug!(shard = self.index, "lock shard stopped");
    }

    fn handle(&mut self, command: Command<K>) {
        match command {
            Command::Acquire {
                key,
                caller,
                token,
                reply,
            } => self.acquire(key, caller, token, reply),
            Command::TryAcquire {
                key,
                caller,
                token,
                reply,
            } => self.try_acquire(key, caller, token, reply),
            Command::Release { key, caller, token } => self.release(key, caller, token),
            Command::Inspect { key, reply } => {
                let _ = reply.send(self.resources.get(&key).map(Resource::info));
            }
            Command::Stats { reply } => {
                let _ = reply.send(LockStats {
                    resources: self.resources.len(),
                    monitors: self.monitors.len(),
                });
            }
        }
    }

    // == Acquire ==
    fn acquire(
        &mut self,
        key: K,
        caller: CallerRef,
        token: LockToken,
        reply: oneshot::Sender<()>,
    ) {
        self.monitors.track(&caller, token, key.clone());

        let dropped = self
            .resources
            .entry(key.clone())
            .or_default()
            .acquire(Waiter::new(caller.id(), token, reply));

        self.forget_dropped(dropped);
        self.reap(&key);
    }

    // == Try Acquire ==
    fn try_acquire(
        &mut self,
        key: K,
        caller: CallerRef,
        token: LockToken,
        reply: oneshot::Sender<bool>,
    ) {
        let granted = self
            .resources
            .entry(key.clone())
            .or_default()
            .try_acquire(caller.id(), token);

        if !granted {
            let _ = reply.send(false);
            self.reap(&key);
            return;
        }

        self.monitors.track(&caller, token, key.clone());
        if reply.send(true).is_err() {
            // The caller stopped waiting for the answer; undo the grant.
            self.release(key, caller.id(), token);
        }
    }

    // == Release ==
    fn release(&mut self, key: K, caller: CallerId, token: LockToken) {
        let Some(resource) = self.resources.get_mut(&key) else {
            debug!(shard = self.index, %caller, ?key, "release on idle key ignored");
            return;
        };

        match resource.release(caller, token) {
            Some(dropped) => {
                self.monitors.forget(caller, token);
                self.forget_dropped(dropped);
            }
            None => {
                debug!(
                    shard = self.index,
                    %caller,
                    ?key,
                    "release of unknown lock instance ignored"
                );
            }
        }
        self.reap(&key);
    }

    // == Caller Down ==
    /// Releases every hold and queued request of a terminated caller.
    fn caller_down(&mut self, caller: CallerId) {
        let Some(instances) = self.monitors.take(caller) else {
            return;
        };

        info!(
            shard = self.index,
            %caller,
            instances = instances.len(),
            "caller terminated, releasing its locks"
        );

        let keys: HashSet<K> = instances.into_values().collect();
        for key in keys {
            if let Some(resource) = self.resources.get_mut(&key) {
                let dropped = resource.remove_caller(caller);
                self.forget_dropped(dropped);
            }
            self.reap(&key);
        }
    }

    fn forget_dropped(&mut self, dropped: Dropped) {
        for (caller, token) in dropped {
            debug!(shard = self.index, %caller, "grant skipped, caller stopped waiting");
            self.monitors.forget(caller, token);
        }
    }

    /// Removes the resource for `key` if nobody owns or awaits it.
    fn reap(&mut self, key: &K) {
        if self.resources.get(key).is_some_and(Resource::is_empty) {
            self.resources.remove(key);
        }
    }
}
