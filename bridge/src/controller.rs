//! BridgeController — owns the poll loop and its teardown.
//!
//! Construction registers any initial observers, then starts the loop. The
//! loop keeps exactly one poll in flight, races it against cancellation, and
//! fans results out to observers in the order they were posted. Teardown runs once on every exit path:
//!
//! ```text
//! Running --dispose()--> Cancelling --teardown--> Disposed
//! Running --transport error-----------teardown--> Disposed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::handle::{BridgeHandle, RemoteError};
use crate::observer::{BridgeNotification, BridgeObserver, Observers};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    Cancelling,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Long-poll window. Also bounds how stale the bridge can get before the
    /// loop notices the remote side is gone.
    pub poll_timeout: Duration,
    /// Upper bound on the best-effort remote release during teardown.
    pub release_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

impl BridgeOptions {
    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    #[must_use]
    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }
}

struct Shared<T> {
    state: watch::Sender<BridgeState>,
    active: AtomicBool,
    observers: Observers<T>,
}

impl<T> Shared<T> {
    fn cancel(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Running {
                *state = BridgeState::Cancelling;
                true
            } else {
                false
            }
        })
    }
}

/// Host-side driver for one remote queue.
///
/// Dropping the controller cancels the loop; teardown then finishes in the
/// background. Use [`dispose`](Self::dispose) to wait for it.
pub struct BridgeController<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> BridgeController<T> {
    /// Start bridging `handle`. Returns before the first poll is issued.
    ///
    /// Observers added later with [`subscribe`](Self::subscribe) only see
    /// events polled after they were added. Use
    /// [`start_with_observers`](Self::start_with_observers) or
    /// [`start_with_channel`](Self::start_with_channel) to see every event.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<H>(handle: H, options: BridgeOptions) -> Self
    where
        H: BridgeHandle<T>,
    {
        Self::start_with_observers(handle, options, Vec::new())
    }

    /// Start bridging `handle` with `observers` registered before the loop
    /// can emit anything.
    pub fn start_with_observers<H>(
        handle: H,
        options: BridgeOptions,
        observers: Vec<Arc<dyn BridgeObserver<T>>>,
    ) -> Self
    where
        H: BridgeHandle<T>,
    {
        let (state, _) = watch::channel(BridgeState::Running);
        let shared = Arc::new(Shared {
            state,
            active: AtomicBool::new(true),
            observers: Observers::new(),
        });
        for observer in observers {
            shared.observers.subscribe(observer);
        }

        tokio::spawn(run(handle, options, Arc::clone(&shared)));
        Self { shared }
    }

    /// Start bridging `handle` with a channel subscribed from the first poll.
    pub fn start_with_channel<H>(
        handle: H,
        options: BridgeOptions,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeNotification<T>>)
    where
        H: BridgeHandle<T>,
        T: Clone,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer: Arc<dyn BridgeObserver<T>> = Arc::new(tx);
        let bridge = Self::start_with_observers(handle, options, vec![observer]);
        (bridge, rx)
    }

    pub fn subscribe(&self, observer: Arc<dyn BridgeObserver<T>>) {
        self.shared.observers.subscribe(observer);
    }

    /// Subscribe an unbounded channel that receives every notification from
    /// now on.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<BridgeNotification<T>>
    where
        T: Clone,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(tx));
        rx
    }

    /// Cancel the loop and wait until teardown, including the remote release
    /// attempt and the dispose notification, has completed. Safe to call more
    /// than once.
    pub async fn dispose(&self) {
        if self.shared.cancel() {
            tracing::debug!("bridge dispose requested");
        }
        let mut state = self.shared.state.subscribe();
        while *state.borrow_and_update() != BridgeState::Disposed {
            if state.changed().await.is_err() {
                break;
            }
        }
    }
}

impl<T> BridgeController<T> {
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.shared.state.borrow()
    }

    /// True from construction until teardown has run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }
}

impl<T> Drop for BridgeController<T> {
    fn drop(&mut self) {
        if self.shared.cancel() {
            tracing::debug!("bridge dropped while running; cancelling");
        }
    }
}

async fn cancellation(state: &mut watch::Receiver<BridgeState>) {
    while *state.borrow_and_update() == BridgeState::Running {
        if state.changed().await.is_err() {
            // Sender lives in `Shared`, which outlives the loop.
            std::future::pending::<()>().await;
        }
    }
}

async fn run<T, H>(handle: H, options: BridgeOptions, shared: Arc<Shared<T>>)
where
    T: Send + 'static,
    H: BridgeHandle<T>,
{
    let mut cancelled = shared.state.subscribe();

    let release_needed = loop {
        let outcome = tokio::select! {
            biased;
            () = cancellation(&mut cancelled) => None,
            result = handle.poll(options.poll_timeout) => Some(result),
        };

        match outcome {
            None => {
                tracing::debug!("bridge loop cancelled");
                break true;
            }
            Some(Ok(None)) => {
                tracing::trace!("poll window elapsed without events");
            }
            Some(Ok(Some(events))) => {
                if *cancelled.borrow() != BridgeState::Running {
                    tracing::debug!(count = events.len(), "dropping events polled during cancel");
                    break true;
                }
                tracing::trace!(count = events.len(), "delivering bridge events");
                shared.observers.emit(&events);
            }
            Some(Err(RemoteError::TargetGone)) => {
                tracing::info!("remote target is gone; skipping release");
                break false;
            }
            Some(Err(e @ RemoteError::Contract(_))) => {
                tracing::error!(error = %e, "bridge poll broke the queue contract");
                break true;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "bridge poll failed");
                break true;
            }
        }
    };

    if release_needed {
        match tokio::time::timeout(options.release_timeout, handle.release()).await {
            Ok(Ok(())) => tracing::debug!("remote queue released"),
            Ok(Err(e)) => tracing::debug!(error = %e, "ignoring failed remote release"),
            Err(_) => tracing::debug!(
                timeout_ms = options.release_timeout.as_millis(),
                "remote release timed out"
            ),
        }
    }
    drop(handle);

    shared.active.store(false, Ordering::Release);
    shared.observers.dispose();
    shared.state.send_replace(BridgeState::Disposed);
}
