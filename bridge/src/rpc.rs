//! RpcHandle — talks to a served queue over a framed JSON-RPC stream.
//!
//! Mirrors the remote side in `tether_queue::serve`: a writer task owns the
//! outgoing half, a reader task routes responses to pending requests by id.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::process::Stdio;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_queue::codec::{FrameReader, FrameWriter};
use tether_queue::protocol::{self, ErrorBody, PollParams, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::handle::{BridgeHandle, RemoteError, RemoteFut};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How long a spawned remote gets to exit on its own after a release.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests awaiting a response. `closed` is set once the reader has gone,
/// so late requests fail instead of waiting forever.
#[derive(Default)]
struct PendingRequests {
    senders: HashMap<u64, oneshot::Sender<Response>>,
    closed: bool,
}

type PendingMap = Arc<std::sync::Mutex<PendingRequests>>;

fn lock_pending(pending: &std::sync::Mutex<PendingRequests>) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forgets a request id when its caller stops waiting, answered or not.
struct PendingGuard<'a> {
    pending: &'a std::sync::Mutex<PendingRequests>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).senders.remove(&self.id);
    }
}

pub struct RpcHandle<T> {
    writer_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    child: Option<Mutex<Child>>,
    reader_handle: JoinHandle<()>,
    _events: PhantomData<fn() -> T>,
}

impl<T> RpcHandle<T> {
    /// Connect over an already established stream.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<Value>(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::debug!("bridge write failed: {e}");
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::default();
        let reader_pending = Arc::clone(&pending);
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => route_response(frame, &reader_pending),
                    Ok(None) => {
                        tracing::debug!("remote closed the bridge stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("bridge read failed: {e}");
                        break;
                    }
                }
            }
            // Dropping the senders fails every outstanding request.
            let mut pending = lock_pending(&reader_pending);
            pending.closed = true;
            pending.senders.clear();
        });

        Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            child: None,
            reader_handle,
            _events: PhantomData,
        }
    }

    /// Spawn `command` and speak the protocol over its stdin/stdout.
    ///
    /// The child is killed if it outlives the handle or does not exit
    /// shortly after a release.
    pub fn spawn(mut command: Command) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child has no stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child has no stdin"))?;

        let mut handle = Self::connect(stdout, stdin);
        handle.child = Some(Mutex::new(child));
        Ok(handle)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            if pending.closed {
                return Err(RemoteError::TargetGone);
            }
            pending.senders.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| RemoteError::Transport(format!("encoding {method} request: {e}")))?;
        if self.writer_tx.send(frame).await.is_err() {
            return Err(RemoteError::TargetGone);
        }

        let response = rx.await.map_err(|_| RemoteError::TargetGone)?;
        response.into_result().map_err(remote_error)
    }

    async fn reap_child(&self) {
        let Some(child) = &self.child else { return };
        let mut child = child.lock().await;
        if tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait())
            .await
            .is_err()
        {
            tracing::debug!("remote process did not exit after release; killing");
            let _ = child.kill().await;
        }
    }
}

impl<T> Drop for RpcHandle<T> {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn route_response(frame: Value, pending: &std::sync::Mutex<PendingRequests>) {
    let response: Response = match serde_json::from_value(frame) {
        Ok(response) => response,
        Err(e) => {
            tracing::trace!("ignoring malformed bridge response: {e}");
            return;
        }
    };
    let sender = lock_pending(pending).senders.remove(&response.id);
    match sender {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => tracing::trace!("response {} has no pending request", response.id),
    }
}

fn remote_error(error: ErrorBody) -> RemoteError {
    if error.code == protocol::TARGET_GONE {
        return RemoteError::TargetGone;
    }
    match error.contract_violation() {
        Some(violation) => RemoteError::Contract(violation),
        None => RemoteError::Transport(format!("{} (code {})", error.message, error.code)),
    }
}

impl<T> BridgeHandle<T> for RpcHandle<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn poll(&self, timeout: Duration) -> RemoteFut<'_, Option<Vec<T>>> {
        Box::pin(async move {
            let params = PollParams {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            };
            let params = serde_json::to_value(params)
                .map_err(|e| RemoteError::Transport(format!("encoding poll params: {e}")))?;
            let result = self.call(protocol::POLL, Some(params)).await?;
            serde_json::from_value(result)
                .map_err(|e| RemoteError::Transport(format!("decoding events: {e}")))
        })
    }

    fn release(&self) -> RemoteFut<'_, ()> {
        Box::pin(async move {
            let outcome = self.call(protocol::RELEASE, None).await.map(drop);
            self.reap_child().await;
            outcome
        })
    }
}
