//! The host's view of a remote queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tether_queue::{ContractViolation, QueueError};
use thiserror::Error;

/// Future returned by [`BridgeHandle`] operations.
pub type RemoteFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote queue contract violated: {0}")]
    Contract(#[from] ContractViolation),
    /// The remote context no longer exists; there is nothing to release.
    #[error("remote target is gone")]
    TargetGone,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_target_gone(&self) -> bool {
        matches!(self, Self::TargetGone)
    }
}

impl From<QueueError> for RemoteError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Released => Self::TargetGone,
            QueueError::Contract(violation) => Self::Contract(violation),
        }
    }
}

/// Operations the host may invoke on a remote queue.
///
/// Posting is deliberately absent: only code inside the remote context can
/// add events.
pub trait BridgeHandle<T>: Send + Sync + 'static {
    /// Long-poll for events. `Ok(None)` means the window elapsed empty.
    fn poll(&self, timeout: Duration) -> RemoteFut<'_, Option<Vec<T>>>;

    /// Ask the remote side to drop the queue.
    fn release(&self) -> RemoteFut<'_, ()>;
}

impl<T, H> BridgeHandle<T> for Arc<H>
where
    H: BridgeHandle<T> + ?Sized,
{
    fn poll(&self, timeout: Duration) -> RemoteFut<'_, Option<Vec<T>>> {
        (**self).poll(timeout)
    }

    fn release(&self) -> RemoteFut<'_, ()> {
        (**self).release()
    }
}
