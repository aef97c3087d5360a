//! Durable storage consumed by the container.
//!
//! A backend stores `(expiry, serialized sketch)` per key. The container reads every
//! record once through [`Backend::process_all`] before serving traffic, and afterwards only
//! writes: updates from the persistence writer and deletes from expiry or explicit removal.
//!
//! [`MemoryBackend`] keeps records in memory. Reopening one instance for a second
//! container behaves like a restart against the same store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{BackendError, Error};

/// Visitor invoked for every stored record with `(key, expiry, data)`
pub type Visitor<'a> = dyn FnMut(&str, u64, &[u8]) -> Result<(), Error> + Send + 'a;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `data` with `expiry` under `key`
    async fn update(&self, key: &str, expiry: u64, data: &[u8]) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Return the stored data and expiry of `key`
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>, BackendError>;

    async fn get_expiry(&self, key: &str) -> Result<Option<u64>, BackendError>;

    /// Visit every stored record, stopping at the first visitor error
    async fn process_all(&self, visit: &mut Visitor<'_>) -> Result<(), Error>;

    /// Make every accepted write durable before returning
    async fn flush(&self) -> Result<(), BackendError>;

    /// Final flush, the backend rejects writes afterwards
    async fn flush_and_stop(&self) -> Result<(), BackendError>;
}

/// In-memory backend
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
    stopped: AtomicBool,
    fail_next: AtomicUsize,
    flushes: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw record, bypassing failure injection
    pub fn insert(&self, key: impl Into<String>, expiry: u64, data: Vec<u8>) {
        self.records.lock().insert(key.into(), (expiry, data));
    }

    /// Fail the next `n` write or flush calls with [`BackendError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    /// Number of completed flushes
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Keys passed to successful deletes, in call order
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Accept writes again after [`Backend::flush_and_stop`], keeping every record
    pub fn reopen(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BackendError::Stopped);
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn update(&self, key: &str, expiry: u64, data: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        self.records
            .lock()
            .insert(key.to_string(), (expiry, data.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check_writable()?;
        self.records.lock().remove(key);
        self.deleted.lock().push(key.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>, BackendError> {
        Ok(self
            .records
            .lock()
            .get(key)
            .map(|(expiry, data)| (data.clone(), *expiry)))
    }

    async fn get_expiry(&self, key: &str) -> Result<Option<u64>, BackendError> {
        Ok(self.records.lock().get(key).map(|(expiry, _)| *expiry))
    }

    async fn process_all(&self, visit: &mut Visitor<'_>) -> Result<(), Error> {
        // visit a snapshot so the visitor may call back into the backend
        let records: Vec<(String, u64, Vec<u8>)> = self
            .records
            .lock()
            .iter()
            .map(|(key, (expiry, data))| (key.clone(), *expiry, data.clone()))
            .collect();
        for (key, expiry, data) in &records {
            visit(key, *expiry, data)?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        self.check_writable()?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush_and_stop(&self) -> Result<(), BackendError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(BackendError::Stopped);
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
