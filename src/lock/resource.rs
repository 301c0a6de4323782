//! Lock Resource Module
//!
//! Ownership and wait-queue state for a single key. This is a plain state
//! machine; the owning shard serializes every call into it.

use std::collections::{HashSet, VecDeque};

use tokio::sync::oneshot;

use super::{CallerId, LockInfo, LockToken};

/// Lock instances that left a resource without an explicit release.
///
/// A queued waiter whose reply channel was already closed when it was
/// promoted is dropped on the spot; its monitor entry must be decremented.
pub(crate) type Dropped = Vec<(CallerId, LockToken)>;

// == Waiter ==
/// A queued acquire request.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) caller: CallerId,
    pub(crate) token: LockToken,
    reply: oneshot::Sender<()>,
}

impl Waiter {
    pub(crate) fn new(caller: CallerId, token: LockToken, reply: oneshot::Sender<()>) -> Self {
        Self {
            caller,
            token,
            reply,
        }
    }
}

// == Resource ==
/// Lock state for one key.
///
/// State transitions:
/// - `Empty -> Owned(c, 1)` on first acquire
/// - `Owned(c, n) -> Owned(c, n + 1)` on reentrant acquire
/// - `Owned(c, n) -> Owned(c, n - 1)` on release with `n > 1`
/// - `Owned(c, 1) -> Empty | Owned(next, 1)` on final release
#[derive(Debug, Default)]
pub(crate) struct Resource {
    /// Current owner, if any
    owner: Option<CallerId>,
    /// Nested acquisitions held by the owner
    hold_count: usize,
    /// Tokens of the owner's granted acquisitions
    instances: HashSet<LockToken>,
    /// FIFO queue of waiting acquisitions
    pending: VecDeque<Waiter>,
}

impl Resource {
    // == Acquire ==
    /// Grants the lock to `waiter` if possible, otherwise queues it.
    pub(crate) fn acquire(&mut self, waiter: Waiter) -> Dropped {
        if self.grantable(waiter.caller) {
            match self.grant(waiter) {
                Ok(()) => Vec::new(),
                Err(lost) => vec![lost],
            }
        } else {
            self.pending.push_back(waiter);
            Vec::new()
        }
    }

    // == Try Acquire ==
    /// Grants the lock without queueing. Returns false on contention.
    pub(crate) fn try_acquire(&mut self, caller: CallerId, token: LockToken) -> bool {
        if !self.grantable(caller) {
            return false;
        }
        self.take_ownership(caller, token);
        true
    }

    // == Release ==
    /// Releases the instance `token` held or awaited by `caller`.
    ///
    /// Returns `None` when the token is unknown to this resource, which is
    /// expected when a timed-out acquire races its own grant.
    pub(crate) fn release(&mut self, caller: CallerId, token: LockToken) -> Option<Dropped> {
        if self.owner == Some(caller) && self.instances.remove(&token) {
            self.hold_count -= 1;
            if self.hold_count == 0 {
                self.owner = None;
                return Some(self.promote());
            }
            return Some(Vec::new());
        }

        let position = self
            .pending
            .iter()
            .position(|w| w.caller == caller && w.token == token)?;
        self.pending.remove(position);
        Some(Vec::new())
    }

    // == Remove Caller ==
    /// Forgets every hold and queued request of a dead caller.
    pub(crate) fn remove_caller(&mut self, caller: CallerId) -> Dropped {
        self.pending.retain(|w| w.caller != caller);

        if self.owner != Some(caller) {
            return Vec::new();
        }
        self.owner = None;
        self.hold_count = 0;
        self.instances.clear();
        self.promote()
    }

    /// Returns true when nobody owns or waits on this resource.
    pub(crate) fn is_empty(&self) -> bool {
        self.owner.is_none() && self.pending.is_empty()
    }

    pub(crate) fn info(&self) -> LockInfo {
        LockInfo {
            owner: self.owner,
            hold_count: self.hold_count,
            waiting: self.pending.len(),
        }
    }

    fn grantable(&self, caller: CallerId) -> bool {
        match self.owner {
            Some(owner) => owner == caller,
            None => self.pending.is_empty(),
        }
    }

    fn take_ownership(&mut self, caller: CallerId, token: LockToken) {
        self.owner = Some(caller);
        self.hold_count += 1;
        self.instances.insert(token);
    }

    /// Hands the lock to `waiter`, unless it stopped listening.
    fn grant(&mut self, waiter: Waiter) -> Result<(), (CallerId, LockToken)> {
        let Waiter {
            caller,
            token,
            reply,
        } = waiter;

        if reply.send(()).is_err() {
            return Err((caller, token));
        }
        self.take_ownership(caller, token);
        Ok(())
    }

    /// Promotes the FIFO head to owner, then any other queued requests of
    /// that same owner (they would be reentrant had they arrived now).
    fn promote(&mut self) -> Dropped {
        let mut dropped = Vec::new();

        while let Some(waiter) = self.pending.pop_front() {
            match self.grant(waiter) {
                Ok(()) => break,
                Err(lost) => dropped.push(lost),
            }
        }

        if let Some(owner) = self.owner {
            let (mine, others): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|w| w.caller == owner);
            self.pending = others;
            for waiter in mine {
                if let Err(lost) = self.grant(waiter) {
                    dropped.push(lost);
                }
            }
        }

        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn caller(n: u64) -> CallerId {
        CallerId::from_raw(n)
    }

    fn token(n: u64) -> LockToken {
        LockToken::from_raw(n)
    }

    fn waiter(c: u64, t: u64) -> (Waiter, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Waiter::new(caller(c), token(t), tx), rx)
    }

    #[test]
    fn test_first_acquire_grants() {
        let mut resource = Resource::default();
        let (w, mut rx) = waiter(1, 1);

        assert!(resource.acquire(w).is_empty());
        assert!(rx.try_recv().is_ok());
        assert_eq!(resource.info().owner, Some(caller(1)));
        assert_eq!(resource.info().hold_count, 1);
    }

    #[test]
    fn test_reentrant_acquire_increments_hold_count() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, mut rx2) = waiter(1, 2);

        resource.acquire(w1);
        resource.acquire(w2);

        assert!(rx2.try_recv().is_ok());
        assert_eq!(resource.info().hold_count, 2);

        resource.release(caller(1), token(2));
        assert_eq!(resource.info().hold_count, 1);
        assert_eq!(resource.info().owner, Some(caller(1)));

        resource.release(caller(1), token(1));
        assert!(resource.is_empty());
    }

    #[test]
    fn test_contended_acquire_queues_fifo() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, mut rx2) = waiter(2, 2);
        let (w3, mut rx3) = waiter(3, 3);

        resource.acquire(w1);
        resource.acquire(w2);
        resource.acquire(w3);
        assert_eq!(resource.info().waiting, 2);
        assert!(rx2.try_recv().is_err());

        resource.release(caller(1), token(1));
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
        assert_eq!(resource.info().owner, Some(caller(2)));

        resource.release(caller(2), token(2));
        assert!(rx3.try_recv().is_ok());
        assert_eq!(resource.info().owner, Some(caller(3)));
    }

    #[test]
    fn test_try_acquire_refuses_when_queue_nonempty() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, _rx2) = waiter(2, 2);
        resource.acquire(w1);
        resource.acquire(w2);

        assert!(!resource.try_acquire(caller(3), token(3)));
        // The owner itself still re-enters.
        assert!(resource.try_acquire(caller(1), token(4)));
        assert_eq!(resource.info().hold_count, 2);
    }

    #[test]
    fn test_promotion_skips_abandoned_waiters() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, rx2) = waiter(2, 2);
        let (w3, mut rx3) = waiter(3, 3);
        resource.acquire(w1);
        resource.acquire(w2);
        resource.acquire(w3);

        drop(rx2);
        let dropped = resource.release(caller(1), token(1)).unwrap();

        assert_eq!(dropped, vec![(caller(2), token(2))]);
        assert!(rx3.try_recv().is_ok());
        assert_eq!(resource.info().owner, Some(caller(3)));
    }

    #[test]
    fn test_promotion_grants_all_requests_of_new_owner() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, mut rx2) = waiter(2, 2);
        let (w3, mut rx3) = waiter(3, 3);
        let (w4, mut rx4) = waiter(2, 4);
        resource.acquire(w1);
        resource.acquire(w2);
        resource.acquire(w3);
        resource.acquire(w4);

        resource.release(caller(1), token(1));

        assert!(rx2.try_recv().is_ok());
        assert!(rx4.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
        assert_eq!(resource.info().hold_count, 2);
        assert_eq!(resource.info().waiting, 1);
    }

    #[test]
    fn test_release_cancels_queued_request() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, _rx2) = waiter(2, 2);
        resource.acquire(w1);
        resource.acquire(w2);

        assert!(resource.release(caller(2), token(2)).is_some());
        assert_eq!(resource.info().waiting, 0);

        resource.release(caller(1), token(1));
        assert!(resource.is_empty());
    }

    #[test]
    fn test_unknown_release_is_ignored() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        resource.acquire(w1);

        assert!(resource.release(caller(1), token(99)).is_none());
        assert!(resource.release(caller(2), token(1)).is_none());
        assert_eq!(resource.info().hold_count, 1);
    }

    #[test]
    fn test_remove_dead_owner_promotes_next() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w1b, _rx1b) = waiter(1, 2);
        let (w2, mut rx2) = waiter(2, 3);
        resource.acquire(w1);
        resource.acquire(w1b);
        resource.acquire(w2);

        resource.remove_caller(caller(1));

        assert!(rx2.try_recv().is_ok());
        assert_eq!(resource.info().owner, Some(caller(2)));
        assert_eq!(resource.info().hold_count, 1);
    }

    #[test]
    fn test_remove_dead_waiter() {
        let mut resource = Resource::default();
        let (w1, _rx1) = waiter(1, 1);
        let (w2, _rx2) = waiter(2, 2);
        resource.acquire(w1);
        resource.acquire(w2);

        assert!(resource.remove_caller(caller(2)).is_empty());
        assert_eq!(resource.info().waiting, 0);
        assert_eq!(resource.info().owner, Some(caller(1)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u64),
        Release(usize),
        Die(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..5).prop_map(Op::Acquire),
            (0usize..16).prop_map(Op::Release),
            (1u64..5).prop_map(Op::Die),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // For any interleaving of acquires, releases and caller deaths the
        // owner's hold count matches its granted instances, and a resource
        // with no owner never keeps a queue.
        #[test]
        fn prop_resource_bookkeeping(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut resource = Resource::default();
            let mut receivers = Vec::new();
            let mut issued: Vec<(u64, u64)> = Vec::new();
            let mut next_token = 0u64;

            for op in ops {
                match op {
                    Op::Acquire(c) => {
                        next_token += 1;
                        let (w, rx) = waiter(c, next_token);
                        receivers.push(rx);
                        resource.acquire(w);
                        issued.push((c, next_token));
                    }
                    Op::Release(i) => {
                        if !issued.is_empty() {
                            let (c, t) = issued.remove(i % issued.len());
                            resource.release(caller(c), token(t));
                        }
                    }
                    Op::Die(c) => {
                        resource.remove_caller(caller(c));
                        issued.retain(|(ic, _)| *ic != c);
                    }
                }

                let info = resource.info();
                prop_assert_eq!(info.hold_count, resource.instances.len());
                prop_assert_eq!(info.owner.is_none(), info.hold_count == 0);
                if info.owner.is_none() {
                    prop_assert_eq!(info.waiting, 0);
                }
                if let Some(owner) = info.owner {
                    prop_assert!(resource.pending.iter().all(|w| w.caller != owner));
                }
            }
        }
    }
}
