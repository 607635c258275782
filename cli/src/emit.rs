use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tether_queue::{RemoteQueue, serve};

#[derive(Debug, Serialize)]
struct Tick {
    seq: u64,
    emitted_at_ms: u64,
}

impl Tick {
    fn now(seq: u64) -> Self {
        let emitted_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self { seq, emitted_at_ms }
    }
}

/// Remote side: answer the host on stdin/stdout until it releases the queue
/// or hangs up.
pub async fn run(count: Option<u64>, interval: Duration) -> Result<()> {
    let queue = RemoteQueue::new();
    let producer = tokio::spawn(produce(Arc::clone(&queue), count, interval));

    let served = serve(queue, tokio::io::stdin(), tokio::io::stdout()).await;
    producer.abort();
    served.context("wire transport failed")?;

    tracing::info!("host released the queue");
    Ok(())
}

async fn produce(queue: Arc<RemoteQueue<Tick>>, count: Option<u64>, interval: Duration) {
    let mut seq = 0;
    while count.is_none_or(|count| seq < count) {
        if queue.is_released() {
            return;
        }
        queue.post(Tick::now(seq));
        tracing::debug!(seq, "posted tick");
        seq += 1;
        tokio::time::sleep(interval).await;
    }
}
