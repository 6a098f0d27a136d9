//! Capacity gates: counting semaphores with priority-ordered wait queues.
//!
//! See `spec.md` §4.3 (C5). A [`Gate`] differs from `tokio::sync::Semaphore`
//! in exactly one way: waiters are woken in priority order (ties broken
//! FIFO), not arrival order. Everything else — permit accounting, RAII
//! release — follows the same shape as `tokio::sync::Semaphore`, which is
//! what every other concurrency-limited worker in the corral lineage
//! (`nvisy_server::pipeline::Worker`, `nvisy_runtime::engine::Engine`) uses
//! for plain (non-prioritized) limiting.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use corral_core::Priority;

struct GateState {
    available: usize,
    /// Waiters bucketed by priority. `BTreeMap` iterates ascending, so the
    /// highest-priority bucket is the last entry — cheap to reach with
    /// `next_back`. Within a bucket, FIFO order is the `VecDeque`'s
    /// natural order.
    ///
    /// The channel carries the `GatePermit` itself, not a bare signal: a
    /// waiter that is dropped (cancelled) after `release` has already sent
    /// into its channel must not lose that permit. Dropping an unread
    /// `GatePermit` re-runs `Gate::release`, handing the capacity on to the
    /// next waiter instead of leaking it.
    waiters: BTreeMap<Priority, VecDeque<oneshot::Sender<GatePermit>>>,
}

/// A counting semaphore with a priority-ordered waiter queue.
///
/// A waiter that is dropped while queued (its task was cancelled) costs
/// nothing at cancellation time: dropping the future simply drops the
/// `oneshot::Receiver`. The dead entry is skipped, at amortized O(1) cost,
/// the next time [`Gate::release`] walks the queue and its `send` fails.
pub struct Gate {
    name: &'static str,
    state: Mutex<GateState>,
}

impl Gate {
    /// Creates a gate with `capacity` permits available immediately.
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(GateState {
                available: capacity,
                waiters: BTreeMap::new(),
            }),
        })
    }

    /// Acquires one permit, waiting in priority order if none are free.
    ///
    /// Cancellation-safe: if the returned future is dropped before it
    /// resolves, no permit is leaked and no other waiter is disturbed — a
    /// permit already in flight to this waiter when that happens is
    /// recovered by [`Gate::release`] via the dropped `GatePermit`, not
    /// lost.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> GatePermit {
        let rx = {
            let mut state = self.state.lock().expect("gate lock poisoned");
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(priority).or_default().push_back(tx);
                Some(rx)
            }
        };

        match rx {
            None => GatePermit {
                gate: Arc::clone(self),
            },
            Some(rx) => {
                tracing::trace!(gate = self.name, priority, "waiting for gate permit");
                rx.await.expect("gate dropped while a waiter was still queued")
            }
        }
    }

    /// Attempts to acquire a permit without waiting. Used by callers that
    /// want to skip a gate entirely (unbounded caps never call this; it
    /// exists for tests and introspection).
    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.available > 0 {
            state.available -= 1;
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Number of permits currently available (for tests/metrics only).
    pub fn available(&self) -> usize {
        self.state.lock().expect("gate lock poisoned").available
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        loop {
            let Some((&priority, queue)) = state.waiters.iter_mut().next_back() else {
                state.available += 1;
                return;
            };
            let Some(tx) = queue.pop_front() else {
                state.waiters.remove(&priority);
                continue;
            };
            if queue.is_empty() {
                state.waiters.remove(&priority);
            }
            // Mint the permit being released directly for this waiter,
            // rather than incrementing `available`; it was never really
            // free.
            let permit = GatePermit {
                gate: Arc::clone(self),
            };
            if let Err(undelivered) = tx.send(permit) {
                // The waiter's future was already dropped (cancelled) before
                // it could receive this permit — `tx.send` hands the value
                // straight back in `Err`. Forget it instead of letting it
                // drop here: dropping would run `GatePermit`'s `Drop`, which
                // re-enters this function and deadlocks on `state`, still
                // locked in this scope. No capacity is lost — `self` is
                // still in hand, and the loop offers it to the next
                // priority-ordered waiter (or, if none remain, to
                // `available` above).
                std::mem::forget(undelivered);
                continue;
            }
            return;
        }
    }
}

/// An RAII permit held by a job for the interval `[ADMITTED, terminal)`.
/// Dropping it releases the gate and wakes the next priority-ordered
/// waiter, per `spec.md` §3 (C5 invariants).
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn single_permit_serializes_waiters() {
        let gate = Gate::new("test", 1);
        let first = gate.acquire(0).await;
        assert_eq!(gate.available(), 0);
        drop(first);
        let second = gate.acquire(0).await;
        assert_eq!(gate.available(), 0);
        drop(second);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_admitted_first() {
        let gate = Gate::new("test", 1);
        let held = gate.acquire(0).await;

        let gate_a = Arc::clone(&gate);
        let gate_b = Arc::clone(&gate);
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = Arc::clone(&order);
        let order_b = Arc::clone(&order);

        let low = tokio::spawn(async move {
            let _permit = gate_a.acquire(0).await;
            order_a.lock().unwrap().push("low");
        });
        tokio::task::yield_now().await;
        let high = tokio::spawn(async move {
            let _permit = gate_b.acquire(5).await;
            order_b.lock().unwrap().push("high");
        });
        tokio::task::yield_now().await;

        drop(held);
        low.await.unwrap();
        high.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_waiter_is_skipped() {
        let gate = Gate::new("test", 1);
        let held = gate.acquire(0).await;

        let gate_cancel = Arc::clone(&gate);
        let cancelled = tokio::spawn(async move {
            let _permit = gate_cancel.acquire(0).await;
        });
        tokio::task::yield_now().await;
        cancelled.abort();
        let _ = cancelled.await;

        let gate_live = Arc::clone(&gate);
        let live = tokio::spawn(async move {
            let _permit = gate_live.acquire(0).await;
            "done"
        });
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(live.await.unwrap(), "done");
    }

    /// Regression test for a permit leak: if a waiter's future is dropped
    /// (cancelled) *after* `release` has already sent it a permit but
    /// *before* it is ever polled again to receive that value, the permit
    /// must come back to the gate rather than vanish. Driven with manual
    /// polling (no tokio runtime needed) so the send-then-drop ordering is
    /// exact rather than racing real task scheduling.
    #[test]
    fn permit_recovered_when_waiter_dropped_after_grant() {
        use std::future::Future;
        use std::pin::Pin;
        use std::task::{Context, Poll, Waker};

        fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
            let mut cx = Context::from_waker(Waker::noop());
            fut.poll(&mut cx)
        }

        let gate = Gate::new("test", 1);

        let mut first = Box::pin(gate.acquire(0));
        let held = match poll_once(first.as_mut()) {
            Poll::Ready(permit) => permit,
            Poll::Pending => panic!("acquiring the only free permit must resolve immediately"),
        };

        let mut second = Box::pin(gate.acquire(0));
        assert!(
            matches!(poll_once(second.as_mut()), Poll::Pending),
            "second acquire must queue behind the held permit"
        );

        // `release` walks the waiter queue and sends the freed permit
        // straight into `second`'s still-registered oneshot channel.
        drop(held);

        // The waiter is cancelled before it ever polls again to receive
        // that permit — the same race a `tokio::select!` against a
        // cancellation token can produce in `admission::CapacitySet::admit`.
        drop(second);

        assert_eq!(
            gate.available(),
            1,
            "permit must not leak when a granted waiter is dropped unread"
        );
    }
}
