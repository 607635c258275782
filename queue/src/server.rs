//! Remote-side endpoint: answers `poll` and `release` for one queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::{CodecError, FrameReader, FrameWriter};
use crate::protocol::{self, ErrorBody, PollParams, Request, Response};
use crate::queue::RemoteQueue;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// Serve `queue` to a single host over a framed JSON-RPC stream.
///
/// Returns once the host has released the queue or closed its end of the
/// stream. Either way the queue is released before returning. Polls are
/// answered from their own tasks, so a `release` can overtake a pending poll.
pub async fn serve<T, R, W>(
    queue: Arc<RemoteQueue<T>>,
    reader: R,
    writer: W,
) -> Result<(), CodecError>
where
    T: Serialize + Send + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(RESPONSE_CHANNEL_CAPACITY);
    let writer_handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(response) = response_rx.recv().await {
            let frame = match serde_json::to_value(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("failed to encode response {}: {e}", response.id);
                    continue;
                }
            };
            if let Err(e) = writer.write_frame(&frame).await {
                tracing::debug!("bridge host stopped reading responses: {e}");
                break;
            }
        }
    });

    let mut reader = FrameReader::new(reader);
    let outcome = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("bridge host closed the stream");
                break Ok(());
            }
            Err(e) => {
                tracing::warn!("bridge transport failed: {e}");
                break Err(e);
            }
        };

        let request: Request = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::trace!("ignoring malformed bridge request: {e}");
                continue;
            }
        };

        match request.method.as_str() {
            protocol::POLL => {
                let params = request
                    .params
                    .clone()
                    .map(serde_json::from_value::<PollParams>);
                let Some(Ok(params)) = params else {
                    let error = ErrorBody::new(protocol::INVALID_PARAMS, "poll needs timeout_ms");
                    let _ = response_tx.send(Response::err(request.id, error)).await;
                    continue;
                };
                let queue = Arc::clone(&queue);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let timeout = Duration::from_millis(params.timeout_ms);
                    let response = poll_response(request.id, queue.poll(timeout).await);
                    let _ = response_tx.send(response).await;
                });
            }
            protocol::RELEASE => {
                queue.release();
                let _ = response_tx
                    .send(Response::ok(request.id, Value::Null))
                    .await;
                break Ok(());
            }
            other => {
                tracing::debug!("bridge host called unknown method {other}");
                let error = ErrorBody::new(
                    protocol::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                );
                let _ = response_tx.send(Response::err(request.id, error)).await;
            }
        }
    };

    // Resolves any pending poll so its task drops its sender.
    queue.release();
    drop(response_tx);
    let _ = writer_handle.await;
    outcome
}

fn poll_response<T: Serialize>(
    id: u64,
    outcome: Result<Option<Vec<T>>, crate::QueueError>,
) -> Response {
    match outcome {
        Ok(events) => match serde_json::to_value(events) {
            Ok(result) => Response::ok(id, result),
            Err(e) => Response::err(
                id,
                ErrorBody::new(protocol::INTERNAL_ERROR, format!("encoding events: {e}")),
            ),
        },
        Err(err) => Response::err(id, err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContractViolation;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Host = (
        FrameReader<ReadHalf<DuplexStream>>,
        FrameWriter<WriteHalf<DuplexStream>>,
    );

    fn start(queue: Arc<RemoteQueue<String>>) -> (Host, tokio::task::JoinHandle<Result<(), CodecError>>) {
        let (host, remote) = tokio::io::duplex(4096);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let server = tokio::spawn(serve(queue, remote_read, remote_write));
        let (host_read, host_write) = tokio::io::split(host);
        ((FrameReader::new(host_read), FrameWriter::new(host_write)), server)
    }

    async fn call(host: &mut Host, request: Request) -> Response {
        host.1
            .write_frame(&serde_json::to_value(request).unwrap())
            .await
            .unwrap();
        let frame = host.0.read_frame().await.unwrap().unwrap();
        serde_json::from_value(frame).unwrap()
    }

    fn poll_request(id: u64, timeout_ms: u64) -> Request {
        Request::new(
            id,
            protocol::POLL,
            Some(serde_json::json!({ "timeout_ms": timeout_ms })),
        )
    }

    #[tokio::test]
    async fn poll_returns_posted_events() {
        let queue = RemoteQueue::new();
        queue.post("one".to_string());
        queue.post("two".to_string());
        let (mut host, _server) = start(Arc::clone(&queue));

        let response = call(&mut host, poll_request(1, 1_000)).await;
        assert_eq!(response.id, 1);
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!(["one", "two"])
        );
    }

    #[tokio::test]
    async fn empty_poll_answers_null_after_timeout() {
        let (mut host, _server) = start(RemoteQueue::new());
        let response = call(&mut host, poll_request(1, 20)).await;
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn release_overtakes_a_pending_poll() {
        let queue = RemoteQueue::new();
        let (mut host, server) = start(Arc::clone(&queue));

        host.1
            .write_frame(&serde_json::to_value(poll_request(1, 30_000)).unwrap())
            .await
            .unwrap();
        host.1
            .write_frame(&serde_json::to_value(Request::new(2, protocol::RELEASE, None)).unwrap())
            .await
            .unwrap();

        let mut responses = Vec::new();
        for _ in 0..2 {
            let frame = host.0.read_frame().await.unwrap().unwrap();
            responses.push(serde_json::from_value::<Response>(frame).unwrap());
        }
        responses.sort_by_key(|r| r.id);

        assert_eq!(
            responses[0].error.as_ref().map(|e| e.code),
            Some(protocol::TARGET_GONE)
        );
        assert!(responses[1].error.is_none());

        server.await.unwrap().unwrap();
        assert!(queue.is_released());
    }

    #[tokio::test]
    async fn concurrent_poll_is_reported_as_a_contract_violation() {
        let (mut host, _server) = start(RemoteQueue::new());

        host.1
            .write_frame(&serde_json::to_value(poll_request(1, 30_000)).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = call(&mut host, poll_request(2, 30_000)).await;
        assert_eq!(response.id, 2);
        let error = response.error.unwrap();
        assert_eq!(error.code, protocol::CONTRACT_VIOLATION);
        assert_eq!(
            error.contract_violation(),
            Some(ContractViolation::ConcurrentPoll)
        );
    }

    #[tokio::test]
    async fn unknown_methods_and_bad_params_get_errors() {
        let (mut host, _server) = start(RemoteQueue::new());

        let response = call(&mut host, Request::new(1, "post", None)).await;
        assert_eq!(response.error.unwrap().code, protocol::METHOD_NOT_FOUND);

        let response = call(&mut host, Request::new(2, protocol::POLL, None)).await;
        assert_eq!(response.error.unwrap().code, protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn host_hangup_releases_the_queue() {
        let queue = RemoteQueue::<String>::new();
        let (host, server) = start(Arc::clone(&queue));
        drop(host);

        server.await.unwrap().unwrap();
        assert!(queue.is_released());
    }
}
