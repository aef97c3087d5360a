//! Time bucketed index of keys with an expiry.
//!
//! Expiry timestamps are grouped in buckets of [`BUCKET_SECS`] seconds. A bucket is
//! identified by its start (`expires_at` rounded down to the granularity) and becomes
//! due once the whole window has passed, so a key is never evicted before its expiry
//! and at most one bucket width plus one sweep interval after it.
//!
//! A live key with an expiry has exactly one entry, in the bucket recorded in its
//! sketch state. Moving an entry between buckets happens under a single write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::sketch::Sketch;

/// Width of an expiry bucket in seconds, a power of two
pub const BUCKET_SECS: u64 = 64;

/// Return the bucket holding `expires_at`
#[inline]
pub fn bucket_of(expires_at: u64) -> u64 {
    expires_at & !(BUCKET_SECS - 1)
}

/// Return whether every expiry in `bucket` is at or before `now`
#[inline]
pub fn is_due(bucket: u64, now: u64) -> bool {
    // the last bucket ends past u64::MAX and is never due
    bucket
        .checked_add(BUCKET_SECS)
        .is_some_and(|end| end <= now)
}

/// One expiring key
#[derive(Clone)]
pub struct ExpiryEntry {
    pub shard: usize,
    pub sketch: Arc<Sketch>,
}

impl ExpiryEntry {
    pub fn new(sketch: Arc<Sketch>) -> Self {
        Self {
            shard: sketch.shard(),
            sketch,
        }
    }
}

#[derive(Default)]
pub struct ExpiryIndex {
    buckets: RwLock<BTreeMap<u64, HashMap<String, ExpiryEntry>>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: u64, entry: ExpiryEntry) {
        self.buckets
            .write()
            .entry(bucket)
            .or_default()
            .insert(entry.sketch.key().to_string(), entry);
    }

    pub fn remove(&self, bucket: u64, key: &str) -> Option<ExpiryEntry> {
        let mut buckets = self.buckets.write();
        let entries = buckets.get_mut(&bucket)?;
        let entry = entries.remove(key);
        if entries.is_empty() {
            buckets.remove(&bucket);
        }
        entry
    }

    /// Move the entry of `entry.sketch` from bucket `from` into bucket `to`
    pub fn relocate(&self, from: Option<u64>, to: u64, entry: ExpiryEntry) {
        let mut buckets = self.buckets.write();
        if let Some(from) = from {
            if let Some(entries) = buckets.get_mut(&from) {
                entries.remove(entry.sketch.key());
                if entries.is_empty() {
                    buckets.remove(&from);
                }
            }
        }
        buckets
            .entry(to)
            .or_default()
            .insert(entry.sketch.key().to_string(), entry);
    }

    /// Return up to `limit` due buckets in ascending order
    pub fn due_buckets(&self, now: u64, limit: usize) -> Vec<u64> {
        self.buckets
            .read()
            .keys()
            .take_while(|&&bucket| is_due(bucket, now))
            .take(limit)
            .copied()
            .collect()
    }

    /// Remove `bucket` from the index and return its entries
    pub fn detach(&self, bucket: u64) -> Option<HashMap<String, ExpiryEntry>> {
        self.buckets.write().remove(&bucket)
    }

    /// Number of non-empty buckets
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Return every bucket holding an entry for `key`
    pub fn buckets_of(&self, key: &str) -> Vec<u64> {
        self.buckets
            .read()
            .iter()
            .filter(|(_, entries)| entries.contains_key(key))
            .map(|(&bucket, _)| bucket)
            .collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;

    fn entry(key: &str) -> ExpiryEntry {
        ExpiryEntry::new(Arc::new(Sketch::new(key, 1, 0)))
    }

    #[test_case(0 => 0)]
    #[test_case(63 => 0)]
    #[test_case(64 => 64)]
    #[test_case(1_700_000_123 => 1_700_000_064)]
    fn test_bucket_of(expires_at: u64) -> u64 {
        bucket_of(expires_at)
    }

    #[test_case(64, 127 => false)]
    #[test_case(64, 128 => true)]
    #[test_case(64, 1_000 => true)]
    #[test_case(bucket_of(u64::MAX), u64::MAX => false; "last bucket")]
    #[test_case(bucket_of(u64::MAX) - BUCKET_SECS, u64::MAX => true; "bucket before last")]
    fn test_is_due(bucket: u64, now: u64) -> bool {
        is_due(bucket, now)
    }

    #[test]
    fn test_relocate_keeps_single_entry() {
        let index = ExpiryIndex::new();
        let e = entry("k");
        index.insert(64, e.clone());
        index.relocate(Some(64), 256, e.clone());
        assert_eq!(index.buckets_of("k"), vec![256]);
        assert_eq!(index.len(), 1);

        index.relocate(None, 512, entry("other"));
        assert_eq!(index.len(), 2);
        assert!(index.remove(256, "k").is_some());
        assert!(index.remove(256, "k").is_none());
        assert_eq!(index.buckets_of("k"), Vec::<u64>::new());
    }

    #[test]
    fn test_due_buckets_sorted_and_limited() {
        let index = ExpiryIndex::new();
        for (i, bucket) in [640u64, 64, 320, 128, 6400].iter().enumerate() {
            index.insert(*bucket, entry(&format!("k{}", i)));
        }
        assert_eq!(index.due_buckets(1_000, 10), vec![64, 128, 320, 640]);
        assert_eq!(index.due_buckets(1_000, 2), vec![64, 128]);
        assert!(index.due_buckets(100, 10).is_empty());

        let detached = index.detach(64).unwrap();
        assert!(detached.contains_key("k1"));
        assert!(index.detach(64).is_none());
        assert_eq!(index.len(), 4);
    }
}
