//! Caller Identity Module
//!
//! A [`Caller`] is the identity a task presents to the lock manager. It owns
//! the sending half of a liveness channel; the manager watches the receiving
//! half and treats its closure as the caller's death.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_CALLER: Caller;
}

// == Caller Id ==
/// Opaque, process-unique identity of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    fn next() -> Self {
        Self(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller#{}", self.0)
    }
}

// == Caller Ref ==
/// Cloneable view of a caller: its id plus a liveness watch.
///
/// Holding a `CallerRef` does not keep the caller alive.
#[derive(Debug, Clone)]
pub struct CallerRef {
    id: CallerId,
    alive: watch::Receiver<()>,
}

impl CallerRef {
    /// Returns the caller's identity.
    pub fn id(&self) -> CallerId {
        self.id
    }

    /// Returns false once the owning [`Caller`] has been dropped.
    pub fn is_alive(&self) -> bool {
        self.alive.has_changed().is_ok()
    }

    /// Resolves when the owning [`Caller`] is dropped.
    pub(crate) async fn terminated(mut self) -> CallerId {
        while self.alive.changed().await.is_ok() {}
        self.id
    }
}

// == Caller ==
/// The identity of a live task for locking purposes.
///
/// Dropping the `Caller` (normal completion, panic unwinding, or task abort)
/// signals its death to every lock manager shard watching it, which then
/// releases the caller's locks and removes it from wait queues.
#[derive(Debug)]
pub struct Caller {
    inner: CallerRef,
    _alive: watch::Sender<()>,
}

impl Caller {
    /// Mints a caller with a fresh identity.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(());
        Self {
            inner: CallerRef {
                id: CallerId::next(),
                alive: rx,
            },
            _alive: tx,
        }
    }

    /// Runs `fut` with this caller installed as the task-local current caller.
    ///
    /// Cache operations issued inside the scope act on behalf of this caller,
    /// so nested isolated operations on a key it already owns re-enter the lock.
    /// The caller dies when the returned future completes or is dropped.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT_CALLER.scope(self, fut)
    }

    /// Returns the caller installed by an enclosing [`Caller::scope`], if any.
    pub fn current() -> Option<CallerRef> {
        CURRENT_CALLER.try_with(|caller| caller.inner.clone()).ok()
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Caller {
    type Target = CallerRef;

    fn deref(&self) -> &CallerRef {
        &self.inner
    }
}
