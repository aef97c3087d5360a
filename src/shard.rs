//! Key space partition owning the sketches of the keys routed to it.
//!
//! The shard lock protects the map structure only. Slot contents are updated
//! through the sketch itself, so readers hold the shard lock just long enough
//! to clone the sketch handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::hash::{HashFunction, Hashing};
use crate::sketch::Sketch;

pub struct Shard {
    id: usize,
    sketches: RwLock<HashMap<String, Arc<Sketch>>>,
}

impl Shard {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            sketches: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.sketches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sketches.read().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Sketch>> {
        self.sketches.read().get(key).cloned()
    }

    /// Return the sketch for `key`, creating it with `make` on a miss.
    ///
    /// The boolean is true when the sketch was created by this call.
    pub fn get_or_create<F>(&self, key: &str, make: F) -> (Arc<Sketch>, bool)
    where
        F: FnOnce() -> Sketch,
    {
        if let Some(sketch) = self.get(key) {
            return (sketch, false);
        }

        let mut sketches = self.sketches.write();
        if let Some(sketch) = sketches.get(key) {
            return (sketch.clone(), false);
        }
        let sketch = Arc::new(make());
        sketches.insert(key.to_string(), sketch.clone());
        (sketch, true)
    }

    /// Insert a restored sketch, replacing any previous one
    pub fn insert(&self, sketch: Arc<Sketch>) {
        self.sketches
            .write()
            .insert(sketch.key().to_string(), sketch);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Sketch>> {
        self.sketches.write().remove(key)
    }

    /// Remove `key` only while it still maps to `sketch`
    pub fn remove_if_same(&self, key: &str, sketch: &Arc<Sketch>) -> bool {
        let mut sketches = self.sketches.write();
        match sketches.get(key) {
            Some(current) if Arc::ptr_eq(current, sketch) => {
                sketches.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.sketches.read().keys().cloned().collect()
    }
}

/// Power-of-two set of shards, routing a key by `hash64(key) & (shards - 1)`
pub struct ShardMap {
    shards: Vec<Shard>,
    mask: u64,
    hashing: Hashing,
}

impl ShardMap {
    /// Create `count` empty shards, `count` must be a power of two
    pub fn new(count: usize, hashing: Hashing) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            shards: (0..count).map(Shard::new).collect(),
            mask: count as u64 - 1,
            hashing,
        }
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    #[inline]
    pub fn shard_of(&self, key: &str) -> &Shard {
        let idx = self.hashing.hash64(key.as_bytes()) & self.mask;
        &self.shards[idx as usize]
    }

    #[inline]
    pub fn shard(&self, id: usize) -> &Shard {
        &self.shards[id]
    }

    pub fn get(&self, key: &str) -> Option<Arc<Sketch>> {
        self.shard_of(key).get(key)
    }

    /// Return the live sketch that replaced `stale` under its key, if any
    pub fn successor(&self, stale: &Arc<Sketch>) -> Option<Arc<Sketch>> {
        self.get(stale.key())
            .filter(|current| !Arc::ptr_eq(current, stale) && !current.is_deleted())
    }

    /// Number of keys over all shards
    pub fn key_count(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.shards.iter().flat_map(Shard::keys).collect()
    }
}
