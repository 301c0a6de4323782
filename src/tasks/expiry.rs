//! Expiry Tick Task
//!
//! Background task that owns an [`ExpiryWheel`], batches TTL updates between
//! ticks and hands every expired key to a callback.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::expiry::{ExpiryCommand, ExpiryWheel};

/// Spawns the task driving `wheel`.
///
/// Each tick runs in order: apply every update received so far, advance the
/// virtual clock, purge the current bucket, call `on_expire` for each purged
/// key, then wait for the next tick. Commands arriving between ticks are only
/// batched.
///
/// # Arguments
/// * `wheel` - The expiry schedule, owned by the task from now on
/// * `commands` - Receiver for updates and queries
/// * `sequence` - Stamp counter the engine bumps after each sent update
/// * `on_expire` - Awaited once per expired key, with the tick's sealed stamp
///
/// # Returns
/// A JoinHandle for the spawned task. The task ends on its own when the
/// command channel closes, or it can be aborted during shutdown.
pub(crate) fn spawn_expiry_task<K, F, Fut>(
    mut wheel: ExpiryWheel<K>,
    mut commands: mpsc::UnboundedReceiver<ExpiryCommand<K>>,
    sequence: Arc<AtomicU64>,
    on_expire: F,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(K, u64) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let interval = wheel.interval();
        info!("Starting expiry task with tick interval of {:?}", interval);

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Loaded before draining: every stamp up to `sealed`
                    // belongs to a command the drain below will see.
                    let sealed = sequence.load(Ordering::SeqCst);

                    // Updates sent before this tick must land before the purge.
                    while let Ok(command) = commands.try_recv() {
                        handle_command(&mut wheel, command);
                    }

                    let expired = wheel.tick();
                    if expired.is_empty() {
                        trace!("Expiry tick: nothing due");
                        continue;
                    }

                    debug!("Expiry tick: purging {} keys", expired.len());
                    for key in expired {
                        on_expire(key, sealed).await;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => handle_command(&mut wheel, command),
                    None => break,
                },
            }
        }

        info!("Expiry task stopped");
    })
}

fn handle_command<K>(wheel: &mut ExpiryWheel<K>, command: ExpiryCommand<K>)
where
    K: Eq + Hash + Clone,
{
    match command {
        ExpiryCommand::Set(key, update) => wheel.queue(key, update),
        ExpiryCommand::Remaining { key, reply } => {
            let _ = reply.send(wheel.remaining(&key));
        }
        ExpiryCommand::Stats { reply } => {
            let _ = reply.send(wheel.stats());
        }
    }
}
