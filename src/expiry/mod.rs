//! Expiry Module
//!
//! Bucketed TTL tracking. The [`ExpiryWheel`] holds the schedule; the
//! [`ExpiryEngine`] is a handle to the background task that owns a wheel,
//! batches updates between ticks and reports expired keys.
//!
//! Every update is stamped from a shared counter. When a key expires, the
//! callback also receives the last stamp the tick had applied, so storage
//! can tell a stale entry from one rewritten while the purge was in flight.

mod wheel;

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CacheError, Result};
use crate::tasks::spawn_expiry_task;

pub use wheel::{ExpiryRecord, ExpiryStats, ExpiryWheel, TtlUpdate};

// == Commands ==
#[derive(Debug)]
pub(crate) enum ExpiryCommand<K> {
    Set(K, TtlUpdate),
    Remaining {
        key: K,
        reply: oneshot::Sender<Option<Duration>>,
    },
    Stats {
        reply: oneshot::Sender<ExpiryStats>,
    },
}

// == Expiry Engine ==
/// Handle to a running expiry task.
///
/// Cloning shares the same task; it stops once every handle is dropped.
#[derive(Debug)]
pub struct ExpiryEngine<K> {
    commands: mpsc::UnboundedSender<ExpiryCommand<K>>,
    /// Stamps issued so far; shared with the task
    sequence: Arc<AtomicU64>,
    interval: Duration,
}

impl<K> Clone for ExpiryEngine<K> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            sequence: Arc::clone(&self.sequence),
            interval: self.interval,
        }
    }
}

impl<K> ExpiryEngine<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    // == Constructor ==
    /// Starts an expiry task ticking every `interval`.
    ///
    /// `on_expire` is awaited once per expired key, inside the task; it is
    /// responsible for deleting the entry from storage. Its second argument
    /// is the sealed stamp: every update stamped at or below it was applied
    /// before the key was found due.
    ///
    /// # Returns
    /// The engine handle and the task's JoinHandle, which can be used to
    /// abort the task during shutdown.
    pub fn spawn<F, Fut>(interval: Duration, time_bits: u32, on_expire: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(K, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let wheel = ExpiryWheel::new(interval, time_bits);
        let interval = wheel.interval();
        let (commands, receiver) = mpsc::unbounded_channel();
        let sequence = Arc::new(AtomicU64::new(0));
        let handle = spawn_expiry_task(wheel, receiver, Arc::clone(&sequence), on_expire);

        let engine = Self {
            commands,
            sequence,
            interval,
        };
        (engine, handle)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    // == Set TTL ==
    /// Queues an expiry update for `key`; it takes effect on the next tick.
    ///
    /// # Returns
    /// The update's stamp. Stamps increase with every call, and an update
    /// the next tick misses always carries a stamp above that tick's seal.
    pub fn set_ttl(&self, key: K, update: TtlUpdate) -> u64 {
        let _ = self.commands.send(ExpiryCommand::Set(key, update));
        // Counted only once sent: a seal covering this stamp covers the command.
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stops tracking `key`. Same as `set_ttl(key, TtlUpdate::Never)`.
    pub fn clear_ttl(&self, key: K) -> u64 {
        self.set_ttl(key, TtlUpdate::Never)
    }

    /// Restarts `key`'s countdown from its last TTL.
    pub fn renew(&self, key: K) -> u64 {
        self.set_ttl(key, TtlUpdate::Renew)
    }

    // == TTL ==
    /// Time left before `key` expires, or `None` if it is not tracked.
    pub async fn ttl(&self, key: K) -> Result<Option<Duration>> {
        let (reply, answer) = oneshot::channel();
        self.send(ExpiryCommand::Remaining { key, reply })?;
        answer.await.map_err(|_| stopped())
    }

    // == Stats ==
    pub async fn stats(&self) -> Result<ExpiryStats> {
        let (reply, answer) = oneshot::channel();
        self.send(ExpiryCommand::Stats { reply })?;
        answer.await.map_err(|_| stopped())
    }

    fn send(&self, command: ExpiryCommand<K>) -> Result<()> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> CacheError {
    CacheError::Unavailable("expiry engine stopped".to_string())
}
