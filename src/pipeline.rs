//! Asynchronous write-back of dirty sketches.
//!
//! ```text
//!  mutation (0 -> 1 pending)          every save_interval              single consumer
//!  ───────────────────────────► PendingQueue[shard % 8] ──saver──► mpsc(channel_capacity) ──writer──► Backend
//!                                        ▲                                                   │
//!                                        └──────── re-enqueue while pending > 0 ◄────────────┘
//! ```
//!
//! A sketch sits in at most one pending queue at a time: only the caller moving its pending
//! counter from 0 to 1 enqueues it, and only the writer re-enqueues it after a write when
//! the counter is still positive. A hot key therefore has at most one backend write in flight.
//!
//! Savers block on a full channel, which bounds how far persistence can fall behind.
//!
//! A deleted sketch can still sit in a queue when its key is created again. Once its backend
//! delete succeeds, the sketch now registered under the key is marked dirty, so the newer
//! state is written after the delete whatever order the two were queued in.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::RetryPolicy;
use crate::error::{BackendError, Error};
use crate::shard::ShardMap;
use crate::sketch::Sketch;

/// Number of pending-write queues
pub const PARTITIONS: usize = 8;
/// Upper bound of passes over the pending queues during the final drain
pub const DRAIN_PASSES: usize = 4;

/// FIFO of sketches with unflushed mutations
#[derive(Default)]
pub struct PendingQueue {
    sketches: Mutex<VecDeque<Arc<Sketch>>>,
}

impl PendingQueue {
    pub fn push(&self, sketch: Arc<Sketch>) {
        self.sketches.lock().push_back(sketch);
    }

    /// Pop up to `max` sketches from the front
    pub fn pop_batch(&self, max: usize) -> VecDeque<Arc<Sketch>> {
        let mut sketches = self.sketches.lock();
        let n = max.min(sketches.len());
        sketches.drain(..n).collect()
    }

    /// Put unsent sketches back in front, keeping their order
    fn requeue_front(&self, unsent: VecDeque<Arc<Sketch>>) {
        let mut sketches = self.sketches.lock();
        for sketch in unsent.into_iter().rev() {
            sketches.push_front(sketch);
        }
    }

    pub fn len(&self) -> usize {
        self.sketches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sketches.lock().is_empty()
    }
}

pub struct Pipeline {
    queues: Vec<PendingQueue>,
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    shards: Arc<ShardMap>,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy, shards: Arc<ShardMap>) -> Self {
        Self {
            queues: (0..PARTITIONS).map(|_| PendingQueue::default()).collect(),
            backend,
            retry,
            shards,
        }
    }

    #[inline]
    pub fn partition_of(shard: usize) -> usize {
        shard % PARTITIONS
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Push `sketch` onto the pending queue of its partition
    pub fn enqueue(&self, sketch: Arc<Sketch>) {
        self.queues[Self::partition_of(sketch.shard())].push(sketch);
    }

    /// Record a mutation of `sketch`, enqueueing it on the 0 -> 1 transition
    pub fn schedule(&self, sketch: &Arc<Sketch>) {
        if sketch.mark_dirty() == 1 {
            self.enqueue(sketch.clone());
        }
    }

    /// Number of sketches waiting in pending queues
    pub fn pending_len(&self) -> usize {
        self.queues.iter().map(PendingQueue::len).sum()
    }

    /// Periodically move dirty sketches of one partition into the writer channel
    pub(crate) async fn run_saver(
        self: Arc<Self>,
        partition: usize,
        tx: mpsc::Sender<Arc<Sketch>>,
        period: Duration,
        batch: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let queue = &self.queues[partition];
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut sketches = queue.pop_batch(batch);
                    if !sketches.is_empty() {
                        debug!(partition, count = sketches.len(), "moving dirty sketches to writer");
                    }
                    while let Some(sketch) = sketches.pop_front() {
                        tokio::select! {
                            permit = tx.reserve() => match permit {
                                Ok(permit) => permit.send(sketch),
                                Err(_) => {
                                    sketches.push_front(sketch);
                                    queue.requeue_front(sketches);
                                    return;
                                }
                            },
                            _ = shutdown.recv() => {
                                sketches.push_front(sketch);
                                queue.requeue_front(sketches);
                                return;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(partition, "saver shutting down");
                    return;
                }
            }
        }
    }

    /// Consume the writer channel until shutdown, then write what is already buffered
    pub(crate) async fn run_writer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<Sketch>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(sketch) => self.write(sketch).await,
                    None => return,
                },
                _ = shutdown.recv() => break,
            }
        }

        rx.close();
        while let Some(sketch) = rx.recv().await {
            self.write(sketch).await;
        }
        debug!("writer shutting down");
    }

    /// Write one dirty sketch to the backend.
    ///
    /// A deleted sketch is deleted from the backend, and every registered deletion waiter is
    /// completed after a flush. A live sketch is serialized and updated. Sketches that
    /// received more mutations meanwhile, or whose update failed, go back to their queue.
    pub async fn write(&self, sketch: Arc<Sketch>) {
        let pending = sketch.pending();
        let key = sketch.key();

        if sketch.is_deleted() {
            let mut result = self.attempt("delete", key, || self.backend.delete(key)).await;
            let mut waiters = std::mem::take(&mut sketch.lock().waiters);
            if result.is_ok() && !waiters.is_empty() {
                result = self.attempt("flush", key, || self.backend.flush()).await;
            }
            for waiter in waiters.drain(..) {
                // the caller may have timed out already
                let _ = waiter.send(result.clone().map_err(Error::from));
            }
            match result {
                Ok(()) => {
                    debug!(key, "deleted from backend");
                    if let Some(current) = self.shards.successor(&sketch) {
                        debug!(key, "key recreated meanwhile, rewriting current sketch");
                        self.schedule(&current);
                    }
                    if sketch.mark_flushed(pending) > 0 {
                        self.enqueue(sketch);
                    }
                }
                Err(e) => {
                    error!(key, error = %e, "failed to delete from backend");
                    self.retry_later(sketch, &e);
                }
            }
            return;
        }

        let expiry = sketch.expires_at();
        let data = sketch.to_bytes();
        let result = self
            .attempt("update", key, || self.backend.update(key, expiry, &data))
            .await;
        match result {
            Ok(()) => {
                if sketch.mark_flushed(pending) > 0 {
                    self.enqueue(sketch);
                }
            }
            Err(e) => {
                error!(key, error = %e, "failed to update backend, keeping sketch dirty");
                self.retry_later(sketch, &e);
            }
        }
    }

    /// Keep a sketch whose write failed dirty, unless the backend will never accept it
    fn retry_later(&self, sketch: Arc<Sketch>, error: &BackendError) {
        if *error != BackendError::Stopped {
            self.enqueue(sketch);
        }
    }

    /// Write every sketch waiting in pending queues, including sketches re-enqueued by those
    /// writes, for at most [`DRAIN_PASSES`] passes.
    ///
    /// Returns the number of writes issued.
    pub async fn drain(&self) -> usize {
        let mut written = 0;
        for _ in 0..DRAIN_PASSES {
            let mut progressed = false;
            for queue in &self.queues {
                let sketches = queue.pop_batch(usize::MAX);
                written += sketches.len();
                progressed |= !sketches.is_empty();
                for sketch in sketches {
                    self.write(sketch).await;
                }
            }
            if !progressed {
                break;
            }
        }
        let left = self.pending_len();
        if left > 0 {
            warn!(left, "dirty sketches left after final drain");
        } else {
            info!(written, "pending writes drained");
        }
        written
    }

    /// Delete `key` from the backend right away
    pub async fn delete_now(&self, key: &str) -> Result<(), BackendError> {
        self.attempt("delete", key, || self.backend.delete(key)).await
    }

    /// Run a backend call, retrying with backoff according to the retry policy
    async fn attempt<F, Fut>(&self, op: &str, key: &str, mut call: F) -> Result<(), BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(BackendError::Stopped) => return Err(BackendError::Stopped),
                Err(e) if attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    warn!(op, key, attempt, error = %e, "backend call failed, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
