//! In-process handle onto a [`RemoteQueue`].

use std::sync::Arc;
use std::time::Duration;

use tether_queue::RemoteQueue;

use crate::handle::{BridgeHandle, RemoteError, RemoteFut};

/// Handle for a queue living in the same process, e.g. on another task.
pub struct LocalHandle<T> {
    queue: Arc<RemoteQueue<T>>,
}

impl<T> LocalHandle<T> {
    #[must_use]
    pub fn new(queue: Arc<RemoteQueue<T>>) -> Self {
        Self { queue }
    }
}

impl<T: Send + 'static> BridgeHandle<T> for LocalHandle<T> {
    fn poll(&self, timeout: Duration) -> RemoteFut<'_, Option<Vec<T>>> {
        Box::pin(async move { self.queue.poll(timeout).await.map_err(RemoteError::from) })
    }

    fn release(&self) -> RemoteFut<'_, ()> {
        Box::pin(async move {
            if self.queue.is_released() {
                return Err(RemoteError::TargetGone);
            }
            self.queue.release();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_queue::ContractViolation;

    #[tokio::test]
    async fn poll_and_release_map_queue_errors() {
        let queue = RemoteQueue::new();
        let handle = LocalHandle::new(Arc::clone(&queue));

        queue.post(5_u8);
        assert_eq!(
            handle.poll(Duration::from_millis(10)).await,
            Ok(Some(vec![5]))
        );
        assert_eq!(handle.poll(Duration::from_millis(10)).await, Ok(None));

        handle.release().await.unwrap();
        assert!(queue.is_released());
        assert_eq!(
            handle.poll(Duration::from_millis(10)).await,
            Err(RemoteError::TargetGone)
        );
        assert_eq!(handle.release().await, Err(RemoteError::TargetGone));
    }

    #[tokio::test]
    async fn concurrent_poll_surfaces_as_contract_error() {
        let queue = RemoteQueue::<u8>::new();
        let handle = Arc::new(LocalHandle::new(Arc::clone(&queue)));
        let first = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.poll(Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            handle.poll(Duration::from_secs(30)).await,
            Err(RemoteError::Contract(ContractViolation::ConcurrentPoll))
        );
        queue.release();
        assert_eq!(first.await.unwrap(), Err(RemoteError::TargetGone));
    }
}
