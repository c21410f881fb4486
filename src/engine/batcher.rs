// Batcher task: drains the URL queue, dispatching in batches of up to
// BATCH_SIZE or whenever the flush timer fires, whichever comes first.
// Exactly one batcher runs per engine; it returns the receiver on exit so
// the engine can restart it for a later batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::types::QueuedUrl;

use super::EngineInner;

const BATCH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

pub(super) async fn run_batcher(
    inner: Arc<EngineInner>,
    mut rx: mpsc::Receiver<QueuedUrl>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<QueuedUrl> {
    let mut batch: Vec<QueuedUrl> = Vec::with_capacity(BATCH_SIZE);
    // Armed when the first URL of a batch arrives; cleared on flush.
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(item) => {
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + FLUSH_INTERVAL);
                    }
                    batch.push(item);
                    if batch.len() >= BATCH_SIZE {
                        flush(&inner, &mut batch);
                        deadline = None;
                    }
                }
                None => break,
            },
            _ = flush_timer => {
                flush(&inner, &mut batch);
                deadline = None;
            }
        }
    }

    // Shutdown: anything still queued is dropped, but its in-flight
    // reservation must be released or stop() would wait on ghosts.
    let mut drained = batch.len();
    for _ in batch.drain(..) {
        inner.release_inflight();
    }
    while let Ok(_item) = rx.try_recv() {
        drained += 1;
        inner.release_inflight();
    }
    if drained > 0 {
        debug!(drained, "batcher drained queued URLs on shutdown");
    }

    rx
}

fn flush(inner: &Arc<EngineInner>, batch: &mut Vec<QueuedUrl>) {
    if batch.is_empty() {
        return;
    }
    debug!(size = batch.len(), "dispatching URL batch");
    for item in batch.drain(..) {
        inner.spawn_visit(item);
    }
}
