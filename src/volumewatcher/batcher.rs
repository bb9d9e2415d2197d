//! Cross-volume claim update batching
//!
//! Many volume watchers checkpoint claims at the same time when a job with
//! many allocations stops. The batcher collects their updates for a fixed
//! window and commits them as one write, then hands that write's outcome to
//! every submitter.

use crate::common::{Error, Result};
use crate::state::{Claim, ClaimRequest};
use crate::volumewatcher::ClaimWriter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

struct UpdateWork {
    request: ClaimRequest,
    done: oneshot::Sender<Result<u64>>,
}

/// Handle for a submitted update. Resolves with the index of the batch
/// write, or with the batch's error.
pub struct BatchFuture {
    rx: oneshot::Receiver<Result<u64>>,
}

impl BatchFuture {
    pub async fn wait(self) -> Result<u64> {
        // A dropped sender means the batcher shut down before flushing.
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

/// Submission side of the batcher; cheap to clone.
#[derive(Clone)]
pub struct UpdateBatcher {
    tx: mpsc::UnboundedSender<UpdateWork>,
}

impl UpdateBatcher {
    /// Spawn the flush loop. It runs until `cancel` fires; updates still
    /// queued at that point resolve as [`Error::Cancelled`].
    pub fn spawn(
        writer: Arc<dyn ClaimWriter>,
        window: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_batcher(rx, writer, window, cancel));
        (Self { tx }, handle)
    }

    /// Queue a claim update for the current window without waiting for it.
    pub fn create_update(&self, volume_id: &str, namespace: &str, claim: Claim) -> BatchFuture {
        let (done, rx) = oneshot::channel();
        let work = UpdateWork {
            request: ClaimRequest {
                volume_id: volume_id.to_string(),
                namespace: namespace.to_string(),
                claim,
            },
            done,
        };
        if self.tx.send(work).is_err() {
            tracing::debug!(volume_id, namespace, "batcher stopped, dropping claim update");
        }
        BatchFuture { rx }
    }
}

async fn run_batcher(
    mut rx: mpsc::UnboundedReceiver<UpdateWork>,
    writer: Arc<dyn ClaimWriter>,
    window: Duration,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = rx.recv() => match item {
                Some(work) => work,
                None => return,
            },
        };

        let Some(batch) = collect_window(first, &mut rx, window, &cancel).await else {
            return;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = flush(writer.as_ref(), batch) => {}
        }
    }
}

/// Gather everything submitted until the window closes. `None` on cancellation.
async fn collect_window(
    first: UpdateWork,
    rx: &mut mpsc::UnboundedReceiver<UpdateWork>,
    window: Duration,
    cancel: &CancellationToken,
) -> Option<Vec<UpdateWork>> {
    let deadline = time::Instant::now() + window;
    let mut items = vec![first];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = time::sleep_until(deadline) => break,
            maybe = rx.recv() => match maybe {
                Some(work) => items.push(work),
                None => break,
            },
        }
    }
    Some(items)
}

async fn flush(writer: &dyn ClaimWriter, batch: Vec<UpdateWork>) {
    // Later updates for the same claim supersede earlier ones in the window.
    let mut requests: BTreeMap<(String, String, String), ClaimRequest> = BTreeMap::new();
    let mut waiters = Vec::with_capacity(batch.len());
    for work in batch {
        requests.insert(work.request.batch_key(), work.request);
        waiters.push(work.done);
    }

    let claims = requests.len();
    let result = writer
        .upsert_volume_claims(requests.into_values().collect())
        .await;
    match &result {
        Ok(index) => tracing::debug!(claims, waiters = waiters.len(), index, "claim batch committed"),
        Err(e) => tracing::warn!(claims, waiters = waiters.len(), error = %e, "claim batch failed"),
    }

    for done in waiters {
        let outcome = match &result {
            Ok(index) => Ok(*index),
            Err(e) => Err(Error::ClaimWrite(e.to_string())),
        };
        let _ = done.send(outcome);
    }
}
