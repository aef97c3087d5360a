//! Sharded registry of per-key sketches with expiry and optional persistence.
//!
//! ```text
//!                      hash64(key) & (shards - 1)
//!  add_log / del_log ─────────────────────────────► Shard[i] { key -> Arc<Sketch> }
//!  update_expiry                                         │
//!  get_cardinality                                       ├──► ExpiryIndex { bucket -> keys }  ◄── sweeper (sweep_interval)
//!                                                        └──► Pipeline (pending queues)       ◄── savers + writer
//! ```
//!
//! Lock order: a shard lock is always released before a sketch lock is taken, and a sketch
//! lock may be held while taking the expiry index lock, never the other way around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{DecodeError, Error, Result};
use crate::expiry::{bucket_of, ExpiryEntry, ExpiryIndex};
use crate::hash::{HashFunction, Hashing};
use crate::pipeline::{Pipeline, PARTITIONS};
use crate::shard::{Shard, ShardMap};
use crate::sketch::Sketch;

/// Current time in epoch seconds
#[inline]
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Absolute expiry for a time to live in seconds, 0 means never
#[inline]
fn expires_at(ttl: u64) -> u64 {
    if ttl == 0 {
        0
    } else {
        now().saturating_add(ttl)
    }
}

/// Builder of a [`Container`]
pub struct Builder {
    config: Config,
    backend: Option<Arc<dyn Backend>>,
    span: Span,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            span: Span::none(),
        }
    }
}

impl Builder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Persist sketches to `backend` and restore them from it on open
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Span that parents every event emitted by the container and its background tasks
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Restore persisted sketches and start background tasks.
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(self) -> Result<Container> {
        self.config.validate()?;
        let Builder {
            config,
            backend,
            span,
        } = self;

        let shard_count = config.shard_count();
        let hashing = Hashing::from(config.hashing);
        let shards = Arc::new(ShardMap::new(shard_count, hashing));
        let inner = Arc::new(Inner {
            pipeline: backend
                .map(|b| Arc::new(Pipeline::new(b, config.retry.clone(), shards.clone()))),
            shards,
            expiry: ExpiryIndex::new(),
            hashing,
            config,
            span,
        });

        if let Some(pipeline) = &inner.pipeline {
            inner.restore(pipeline).await?;
        }

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();
        let span = inner.span.clone();

        tasks.push(tokio::spawn(
            inner
                .clone()
                .run_sweeper(shutdown.subscribe())
                .instrument(span.clone()),
        ));

        if let Some(pipeline) = &inner.pipeline {
            let (tx, rx) = mpsc::channel(inner.config.channel_capacity);
            for partition in 0..PARTITIONS {
                tasks.push(tokio::spawn(
                    pipeline
                        .clone()
                        .run_saver(
                            partition,
                            tx.clone(),
                            inner.config.save_interval,
                            inner.config.save_batch,
                            shutdown.subscribe(),
                        )
                        .instrument(span.clone()),
                ));
            }
            tasks.push(tokio::spawn(
                pipeline
                    .clone()
                    .run_writer(rx, shutdown.subscribe())
                    .instrument(span.clone()),
            ));
        }

        info!(
            parent: &span,
            shards = shard_count,
            keys = inner.key_count(),
            persistent = inner.pipeline.is_some(),
            "container initialized"
        );

        Ok(Container {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

struct Inner {
    shards: Arc<ShardMap>,
    expiry: ExpiryIndex,
    hashing: Hashing,
    pipeline: Option<Arc<Pipeline>>,
    config: Config,
    span: Span,
}

impl Inner {
    #[inline]
    fn shard_of(&self, key: &str) -> &Shard {
        self.shards.shard_of(key)
    }

    fn key_count(&self) -> usize {
        self.shards.key_count()
    }

    /// Return the sketch of `key`, creating it with `ttl` when missing
    fn get_or_create(&self, key: &str, ttl: u64) -> Arc<Sketch> {
        let shard = self.shard_of(key);
        let expiry = expires_at(ttl);
        let (sketch, created) = shard.get_or_create(key, || Sketch::new(key, shard.id(), expiry));
        if created {
            debug!(parent: &self.span, key, shard = shard.id(), expiry, "created sketch");
            if expiry > 0 {
                self.register_expiry(&sketch);
            }
        }
        sketch
    }

    /// Add an expiry index entry for a sketch that has none yet
    fn register_expiry(&self, sketch: &Arc<Sketch>) {
        let mut state = sketch.lock();
        if state.deleted || state.bucket.is_some() || state.expires_at == 0 {
            return;
        }
        let bucket = bucket_of(state.expires_at);
        self.expiry.insert(bucket, ExpiryEntry::new(sketch.clone()));
        state.bucket = Some(bucket);
    }

    /// Enqueue `sketch` for persistence after an update moved it from clean to dirty
    #[inline]
    fn enqueue_dirty(&self, sketch: &Arc<Sketch>, became_dirty: bool) {
        if let (true, Some(pipeline)) = (became_dirty, &self.pipeline) {
            pipeline.enqueue(sketch.clone());
        }
    }

    fn sweep_expired(&self, now: u64) -> usize {
        let mut expired = 0;
        for bucket in self.expiry.due_buckets(now, self.config.sweep_batch) {
            let Some(entries) = self.expiry.detach(bucket) else {
                continue;
            };
            for (key, entry) in entries {
                {
                    let mut state = entry.sketch.lock();
                    // deleted explicitly, or moved to another bucket after the detach
                    if state.deleted || state.bucket != Some(bucket) {
                        continue;
                    }
                    state.deleted = true;
                    state.bucket = None;
                }
                self.shards
                    .shard(entry.shard)
                    .remove_if_same(&key, &entry.sketch);
                if let Some(pipeline) = &self.pipeline {
                    pipeline.schedule(&entry.sketch);
                }
                debug!(parent: &self.span, key, bucket, "expired");
                expired += 1;
            }
        }
        expired
    }

    async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.sweep_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.sweep_expired(now());
                    if expired > 0 {
                        info!(expired, "expired keys evicted");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("expiry sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// Load one persisted record, deferring keys whose expiry has already passed
    fn restore_record(
        &self,
        key: &str,
        expiry: u64,
        data: &[u8],
        now: u64,
        expired: &mut Vec<String>,
    ) -> Result<(), DecodeError> {
        if expiry != 0 && expiry <= now {
            debug!(parent: &self.span, key, expiry, now, "persisted key already expired");
            expired.push(key.to_string());
            return Ok(());
        }
        let shard = self.shard_of(key);
        let sketch = Arc::new(Sketch::from_bytes(key, shard.id(), expiry, data)?);
        shard.insert(sketch.clone());
        if expiry > 0 {
            self.register_expiry(&sketch);
        }
        Ok(())
    }

    /// Restore every persisted record, then delete the expired ones from the backend
    async fn restore(&self, pipeline: &Pipeline) -> Result<()> {
        let now = now();
        let mut expired = Vec::new();
        let mut restored = 0usize;
        let mut corrupt = 0usize;

        pipeline
            .backend()
            .process_all(&mut |key, expiry, data| {
                match self.restore_record(key, expiry, data, now, &mut expired) {
                    Ok(()) => restored += 1,
                    Err(e) => {
                        corrupt += 1;
                        warn!(parent: &self.span, key, error = %e, "skipping corrupt record");
                    }
                }
                Ok(())
            })
            .await?;

        for key in &expired {
            if let Err(e) = pipeline.delete_now(key).await {
                warn!(
                    parent: &self.span,
                    key,
                    error = %e,
                    "failed to delete expired record, deferring to writer"
                );
                let tombstone = Arc::new(Sketch::new(key.as_str(), self.shard_of(key).id(), 0));
                tombstone.lock().deleted = true;
                pipeline.schedule(&tombstone);
            }
        }

        info!(
            parent: &self.span,
            restored,
            corrupt,
            expired = expired.len(),
            "restored from backend"
        );
        Ok(())
    }
}

/// Sharded registry of per-key cardinality sketches.
///
/// Client operations take `&self` and may run concurrently from any thread.
/// Background tasks (expiry sweeper, persistence savers and writer) run on the
/// tokio runtime the container was opened in until [`Container::shutdown`].
pub struct Container {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Container {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Add `value` to the sketch of `key`, creating the key with `ttl` seconds to live
    /// (0 means never) when it does not exist. `None` or an empty value only creates the key.
    pub fn add_log(&self, key: &str, value: Option<&[u8]>, ttl: u64) {
        let sketch = self.inner.get_or_create(key, ttl);
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            let (pending, updated) = sketch.add_hash(self.inner.hashing.hash32(value));
            self.inner.enqueue_dirty(&sketch, updated && pending == 1);
        }
    }

    /// Add many values to the sketch of `key`, scheduling persistence at most once
    pub fn add_multi_log<I, V>(&self, key: &str, values: I, ttl: u64)
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let sketch = self.inner.get_or_create(key, ttl);
        let mut became_dirty = false;
        for value in values {
            let value = value.as_ref();
            if value.is_empty() {
                continue;
            }
            let (pending, updated) = sketch.add_hash(self.inner.hashing.hash32(value));
            became_dirty |= updated && pending == 1;
        }
        self.inner.enqueue_dirty(&sketch, became_dirty);
    }

    /// Set the time to live of `key` to `ttl` seconds from now, 0 removes the expiry.
    ///
    /// Returns false when the key is unknown or being deleted.
    pub fn update_expiry(&self, key: &str, ttl: u64) -> bool {
        let Some(sketch) = self.inner.shard_of(key).get(key) else {
            return false;
        };

        {
            let mut state = sketch.lock();
            if state.deleted {
                return false;
            }
            let expiry = expires_at(ttl);
            let old_bucket = state.bucket;
            let new_bucket = (expiry > 0).then(|| bucket_of(expiry));
            state.expires_at = expiry;
            if old_bucket != new_bucket {
                match new_bucket {
                    Some(bucket) => {
                        self.inner
                            .expiry
                            .relocate(old_bucket, bucket, ExpiryEntry::new(sketch.clone()));
                    }
                    None => {
                        if let Some(old) = old_bucket {
                            self.inner.expiry.remove(old, key);
                        }
                    }
                }
                state.bucket = new_bucket;
                debug!(parent: &self.inner.span, key, ?old_bucket, ?new_bucket, "moved expiry bucket");
            }
        }

        if let Some(pipeline) = &self.inner.pipeline {
            pipeline.schedule(&sketch);
        }
        true
    }

    /// Delete `key`.
    ///
    /// The key disappears from memory right away. With a backend, the call returns once
    /// the backend confirmed and flushed the deletion, or fails after `delete_timeout`.
    /// Returns `Ok(false)` when the key was unknown, and [`Error::DeleteAborted`] once the
    /// container has been shut down with a backend.
    pub async fn del_log(&self, key: &str) -> Result<bool> {
        if self.inner.pipeline.is_some() && self.closed.load(Ordering::SeqCst) {
            return Err(Error::DeleteAborted {
                key: key.to_string(),
            });
        }
        let Some(sketch) = self.inner.shard_of(key).remove(key) else {
            return Ok(false);
        };

        let confirmation = {
            let mut state = sketch.lock();
            state.deleted = true;
            if let Some(bucket) = state.bucket.take() {
                self.inner.expiry.remove(bucket, key);
            }
            self.inner.pipeline.as_ref().map(|_| {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            })
        };

        let (Some(pipeline), Some(rx)) = (&self.inner.pipeline, confirmation) else {
            debug!(parent: &self.inner.span, key, "deleted");
            return Ok(true);
        };
        pipeline.schedule(&sketch);
        drop(sketch);

        let timeout = self.inner.config.delete_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(true),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::DeleteAborted {
                key: key.to_string(),
            }),
            Err(_) => {
                warn!(parent: &self.inner.span, key, ?timeout, "deletion not confirmed in time");
                Err(Error::DeleteTimeout {
                    key: key.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Return the estimated number of distinct values of `key`, 0 for unknown keys
    pub fn get_cardinality(&self, key: &str) -> u64 {
        self.inner
            .shard_of(key)
            .get(key)
            .map_or(0, |sketch| sketch.estimate())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.shard_of(key).get(key).is_some()
    }

    /// Return the absolute expiry of `key` in epoch seconds, `Some(0)` when it never expires
    pub fn expiry(&self, key: &str) -> Option<u64> {
        self.inner
            .shard_of(key)
            .get(key)
            .map(|sketch| sketch.expires_at())
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.inner.key_count()
    }

    /// Snapshot of every live key, in no particular order
    pub fn keys(&self) -> Vec<String> {
        self.inner.shards.keys()
    }

    /// Number of dirty sketches waiting for a saver
    pub fn pending_writes(&self) -> usize {
        self.inner
            .pipeline
            .as_ref()
            .map_or(0, |pipeline| pipeline.pending_len())
    }

    /// Evict keys of every due expiry bucket as of `now` (epoch seconds), up to the
    /// configured sweep batch. Returns the number of evicted keys.
    pub fn sweep_expired(&self, now: u64) -> usize {
        self.inner.sweep_expired(now)
    }

    /// Stop background tasks, write remaining dirty sketches and stop the backend
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let span = self.inner.span.clone();
        async {
            let _ = self.shutdown.send(());
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "background task failed");
                }
            }
            if let Some(pipeline) = &self.inner.pipeline {
                pipeline.drain().await;
                pipeline.backend().flush_and_stop().await?;
            }
            info!("container stopped");
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
