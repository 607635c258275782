//! Event queue with a single long-poll waiter.
//!
//! The waiter is an explicit two-state object (`Idle` / `Pending`). Every
//! registration gets a fresh generation number; wake and timeout callbacks
//! carry the generation they were scheduled for and do nothing when it no
//! longer matches the pending waiter.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Caller misuse of the single-consumer contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractViolation {
    #[error("a poll is already pending on this queue")]
    ConcurrentPoll,
    #[error("waiter woke up to an empty queue")]
    EmptyWake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("queue has been released")]
    Released,
}

type PollOutcome<T> = Result<Option<Vec<T>>, QueueError>;

enum WaiterState<T> {
    Idle,
    Pending {
        deadline: Instant,
        generation: u64,
        wake_scheduled: bool,
        runtime: Handle,
        timer: AbortHandle,
        reply: oneshot::Sender<PollOutcome<T>>,
    },
}

struct ClearedWaiter<T> {
    timer: AbortHandle,
    reply: oneshot::Sender<PollOutcome<T>>,
}

struct Inner<T> {
    events: VecDeque<T>,
    waiter: WaiterState<T>,
    next_generation: u64,
    released: bool,
}

impl<T> Inner<T> {
    fn drain(&mut self) -> Vec<T> {
        self.events.drain(..).collect()
    }

    /// Put undelivered events back in front of anything posted since.
    fn requeue(&mut self, events: Vec<T>) {
        for event in events.into_iter().rev() {
            self.events.push_front(event);
        }
    }

    /// Clear the waiter if it is still the one registered as `generation`.
    fn take_waiter(&mut self, generation: u64) -> Option<ClearedWaiter<T>> {
        match &self.waiter {
            WaiterState::Pending {
                generation: pending,
                ..
            } if *pending == generation => {}
            _ => return None,
        }
        match mem::replace(&mut self.waiter, WaiterState::Idle) {
            WaiterState::Pending { timer, reply, .. } => Some(ClearedWaiter { timer, reply }),
            WaiterState::Idle => None,
        }
    }

    /// Hand `outcome` to the poller. Events it can no longer receive go back
    /// to the head of the queue.
    fn resolve(&mut self, reply: oneshot::Sender<PollOutcome<T>>, outcome: PollOutcome<T>) {
        if let Err(Ok(Some(events))) = reply.send(outcome) {
            tracing::debug!(
                count = events.len(),
                "poller went away before delivery; requeueing events"
            );
            self.requeue(events);
        }
    }
}

/// Single-consumer FIFO of events with long-poll delivery.
///
/// Shared as `Arc<RemoteQueue<T>>`: producers hold clones to call
/// [`post`](Self::post) and the consumer side polls.
pub struct RemoteQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send + 'static> RemoteQueue<T> {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                waiter: WaiterState::Idle,
                next_generation: 0,
                released: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event` to the tail of the queue.
    ///
    /// If a poll is pending, at most one wake is scheduled per waiter; events
    /// posted before it runs are delivered together in that one wake.
    pub fn post(self: &Arc<Self>, event: T) {
        let mut inner = self.lock();
        if inner.released {
            tracing::trace!("dropping event posted to a released queue");
            return;
        }
        inner.events.push_back(event);

        if let WaiterState::Pending {
            generation,
            wake_scheduled,
            runtime,
            ..
        } = &mut inner.waiter
            && !*wake_scheduled
        {
            *wake_scheduled = true;
            let generation = *generation;
            let queue = Arc::clone(self);
            runtime.spawn(async move { queue.on_wake(generation) });
        }
    }

    /// Long-poll for events.
    ///
    /// Returns queued events immediately when there are any. Otherwise waits
    /// up to `timeout` and resolves with `Ok(None)` if nothing arrived.
    pub async fn poll(self: &Arc<Self>, timeout: Duration) -> PollOutcome<T> {
        let receiver = {
            let mut inner = self.lock();
            if inner.released {
                return Err(QueueError::Released);
            }
            if matches!(inner.waiter, WaiterState::Pending { .. }) {
                return Err(ContractViolation::ConcurrentPoll.into());
            }
            if !inner.events.is_empty() {
                return Ok(Some(inner.drain()));
            }

            let generation = inner.next_generation;
            inner.next_generation += 1;
            let deadline = Instant::now() + timeout;
            let runtime = Handle::current();

            let queue = Arc::clone(self);
            let timer = runtime
                .spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    queue.on_timeout(generation);
                })
                .abort_handle();

            let (reply, receiver) = oneshot::channel();
            inner.waiter = WaiterState::Pending {
                deadline,
                generation,
                wake_scheduled: false,
                runtime,
                timer,
                reply,
            };
            tracing::trace!(generation, timeout_ms = timeout.as_millis(), "poll waiting");
            receiver
        };

        receiver.await.unwrap_or(Err(QueueError::Released))
    }

    fn on_wake(&self, generation: u64) {
        let mut inner = self.lock();
        let Some(waiter) = inner.take_waiter(generation) else {
            tracing::trace!(generation, "ignoring stale wake");
            return;
        };
        waiter.timer.abort();

        if inner.events.is_empty() {
            inner.resolve(waiter.reply, Err(ContractViolation::EmptyWake.into()));
            return;
        }
        let events = inner.drain();
        inner.resolve(waiter.reply, Ok(Some(events)));
    }

    fn on_timeout(&self, generation: u64) {
        let mut inner = self.lock();
        let Some(waiter) = inner.take_waiter(generation) else {
            tracing::trace!(generation, "ignoring stale timeout");
            return;
        };

        // A wake may be scheduled but not yet run; the events win either way.
        let outcome = if inner.events.is_empty() {
            None
        } else {
            Some(inner.drain())
        };
        inner.resolve(waiter.reply, Ok(outcome));
    }

    /// Release the queue: pending and future polls fail with
    /// [`QueueError::Released`] and later posts are discarded.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        inner.released = true;
        let dropped = inner.events.len();
        inner.events.clear();

        if let WaiterState::Pending { timer, reply, .. } =
            mem::replace(&mut inner.waiter, WaiterState::Idle)
        {
            timer.abort();
            let _ = reply.send(Err(QueueError::Released));
        }
        tracing::debug!(dropped, "remote queue released");
    }
}

impl<T> RemoteQueue<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has_waiter(&self) -> bool {
        self.waiter_deadline().is_some()
    }

    /// Deadline of the pending poll, if there is one.
    #[must_use]
    pub fn waiter_deadline(&self) -> Option<Instant> {
        match &self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiter
        {
            WaiterState::Pending { deadline, .. } => Some(*deadline),
            WaiterState::Idle => None,
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(30);

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn posts_before_poll_are_returned_in_order() {
        let queue = RemoteQueue::new();
        for n in 1..=4 {
            queue.post(n);
        }

        let events = queue.poll(LONG).await.unwrap();
        assert_eq!(events, Some(vec![1, 2, 3, 4]));
        assert!(queue.is_empty());
        assert!(!queue.has_waiter());
    }

    #[tokio::test]
    async fn empty_poll_times_out_with_none() {
        let queue = RemoteQueue::<u32>::new();
        let timeout = Duration::from_millis(50);

        let started = std::time::Instant::now();
        let result = queue.poll(timeout).await.unwrap();

        assert_eq!(result, None);
        assert!(started.elapsed() >= timeout);
        assert!(queue.is_empty());
        assert!(!queue.has_waiter());
    }

    #[tokio::test]
    async fn back_to_back_posts_are_coalesced_into_one_wake() {
        let queue = RemoteQueue::new();
        let poller = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;
        assert!(queue.has_waiter());

        queue.post("a");
        queue.post("b");

        let events = poller.await.unwrap().unwrap();
        assert_eq!(events, Some(vec!["a", "b"]));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn second_poll_while_pending_is_a_contract_violation() {
        let queue = RemoteQueue::<u32>::new();
        let poller = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;

        let second = queue.poll(LONG).await;
        assert_eq!(
            second,
            Err(QueueError::Contract(ContractViolation::ConcurrentPoll))
        );

        // The first poll is unaffected.
        queue.post(7);
        assert_eq!(poller.await.unwrap(), Ok(Some(vec![7])));
    }

    #[tokio::test]
    async fn stale_timeout_does_not_resolve_a_newer_waiter() {
        let queue = RemoteQueue::new();
        queue.post(1);
        assert_eq!(queue.poll(LONG).await, Ok(Some(vec![1])));

        // Generation 0 is registered and then resolved by a wake.
        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;
        queue.post(2);
        assert_eq!(first.await.unwrap(), Ok(Some(vec![2])));

        let second = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;

        queue.on_timeout(0);
        settle().await;
        assert!(queue.has_waiter());
        assert!(!second.is_finished());

        queue.post(3);
        assert_eq!(second.await.unwrap(), Ok(Some(vec![3])));
    }

    #[tokio::test]
    async fn timeout_with_events_present_returns_the_events() {
        let queue = RemoteQueue::new();
        let poller = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;

        // Event is queued but its wake has not run yet when the timer fires.
        queue.lock().events.push_back("late");
        queue.on_timeout(0);

        assert_eq!(poller.await.unwrap(), Ok(Some(vec!["late"])));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn abandoned_poll_keeps_events_for_the_next_poll() {
        let queue = RemoteQueue::new();

        tokio::select! {
            _ = queue.poll(LONG) => panic!("poll should still be pending"),
            () = settle() => {}
        }
        assert!(queue.has_waiter());

        queue.post("kept");
        settle().await;

        assert!(!queue.has_waiter());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.poll(LONG).await, Ok(Some(vec!["kept"])));
    }

    #[tokio::test]
    async fn release_fails_pending_and_later_polls() {
        let queue = RemoteQueue::<u32>::new();
        let poller = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;

        queue.release();
        assert_eq!(poller.await.unwrap(), Err(QueueError::Released));

        queue.post(1);
        assert!(queue.is_empty());
        assert!(queue.is_released());
        assert_eq!(queue.poll(LONG).await, Err(QueueError::Released));
    }

    #[tokio::test]
    async fn waiter_deadline_tracks_the_requested_timeout() {
        let queue = RemoteQueue::<u32>::new();
        assert!(queue.waiter_deadline().is_none());

        let before = Instant::now();
        let poller = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.poll(LONG).await }
        });
        settle().await;

        let deadline = queue.waiter_deadline().unwrap();
        assert!(deadline >= before + LONG);
        queue.release();
        let _ = poller.await;
    }
}
