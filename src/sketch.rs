//! HyperLogLog sketch estimating the number of distinct values seen by one key.
//!
//! # Data-structure design rationale
//!
//! The sketch has `M = 256` slots. The top 8 bits of a 32-bit value hash select a slot,
//! the remaining 24 bits provide the rank: number of leading zeros plus one, in `[1..25]`.
//! A slot only ever grows, it keeps the maximum rank seen for its index.
//!
//! ## Concurrent updates
//! - Slots are atomics. An insert whose rank does not beat the current slot value
//!   returns after a single atomic load, without locking.
//! - Otherwise the insert takes the sketch lock in shared mode and runs a
//!   compare-and-swap loop on the slot, so many writers can update different slots at once.
//! - Exclusive mode of the same lock is taken to serialize, to change expiry and to mark
//!   the sketch deleted, which gives those operations a stable view of all slots.
//!
//! ## Write-back bookkeeping
//! `pending` counts mutations not yet written to the backend. The caller that moves it
//! from 0 to 1 enqueues the sketch for persistence, the writer subtracts what it observed
//! before writing and re-enqueues if anything arrived meanwhile.
//!
//! ## Estimate
//! Raw estimate `alpha * M^2 / sum(2^-slot)` with linear counting for small ranges
//! and the `2^32` correction for very large ones.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::sync::oneshot;

use crate::encoding::{self, SLOTS};
use crate::error::{DecodeError, Error};

/// Number of slots as `f64`
const M: f64 = SLOTS as f64;
/// `2^32` as `f64`
const TWO_POW_32: f64 = 4_294_967_296.0;

/// Completion signal of one pending deletion request
pub(crate) type DeleteWaiter = oneshot::Sender<Result<(), Error>>;

/// Mutable metadata guarded by the sketch lock
pub(crate) struct State {
    /// Absolute expiry in epoch seconds, 0 means never
    pub(crate) expires_at: u64,
    /// Expiry bucket currently holding an entry for this sketch
    pub(crate) bucket: Option<u64>,
    pub(crate) deleted: bool,
    /// Callers waiting for the backend to confirm deletion
    pub(crate) waiters: Vec<DeleteWaiter>,
}

/// Per-key HyperLogLog sketch
pub struct Sketch {
    key: String,
    shard: usize,
    slots: [AtomicU8; SLOTS],
    non_zero: AtomicU32,
    pending: AtomicI64,
    state: RwLock<State>,
}

impl Sketch {
    /// Create an empty sketch owned by `shard`
    pub fn new(key: impl Into<String>, shard: usize, expires_at: u64) -> Self {
        Self {
            key: key.into(),
            shard,
            slots: std::array::from_fn(|_| AtomicU8::new(0)),
            non_zero: AtomicU32::new(0),
            pending: AtomicI64::new(0),
            state: RwLock::new(State {
                expires_at,
                bucket: None,
                deleted: false,
                waiters: Vec::new(),
            }),
        }
    }

    /// Rebuild a sketch from bytes produced by [`Sketch::to_bytes`]
    pub fn from_bytes(
        key: impl Into<String>,
        shard: usize,
        expires_at: u64,
        data: &[u8],
    ) -> Result<Self, DecodeError> {
        let decoded = encoding::decode(data)?;
        let sketch = Self::new(key, shard, expires_at);
        for (slot, rank) in sketch.slots.iter().zip(decoded.slots) {
            slot.store(rank, Ordering::Relaxed);
        }
        sketch.non_zero.store(decoded.non_zero, Ordering::Relaxed);
        Ok(sketch)
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Index of the shard owning this sketch
    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Absolute expiry in epoch seconds, 0 means never
    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.state.read().expires_at
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }

    /// Number of slots holding a non-zero rank
    #[inline]
    pub fn non_zero(&self) -> u32 {
        self.non_zero.load(Ordering::Acquire)
    }

    /// Insert a 32-bit value hash.
    ///
    /// Returns the pending mutation count after this insert and whether a slot changed.
    /// When no slot changed the count is reported as 0.
    pub fn add_hash(&self, h: u32) -> (i64, bool) {
        let idx = (h >> 24) as usize;
        let rank = ((h << 8).leading_zeros().min(24) + 1) as u8;

        let slot = &self.slots[idx];
        let mut current = slot.load(Ordering::Acquire);
        if current >= rank {
            return (0, false);
        }

        let _guard = self.state.read();
        while current < rank {
            match slot.compare_exchange_weak(current, rank, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if current == 0 {
                        self.non_zero.fetch_add(1, Ordering::AcqRel);
                    }
                    return (self.mark_dirty(), true);
                }
                Err(actual) => current = actual,
            }
        }
        (0, false)
    }

    /// Return the cardinality estimate
    pub fn estimate(&self) -> u64 {
        let _guard = self.state.read();
        let sum: f64 = self
            .slots
            .iter()
            .map(|slot| 1.0 / (1u64 << slot.load(Ordering::Acquire)) as f64)
            .sum();
        let raw = alpha() * M * M / sum;

        if raw <= 2.5 * M {
            let zeros = SLOTS as u32 - self.non_zero.load(Ordering::Acquire);
            if zeros != 0 {
                return (M * (M / f64::from(zeros)).ln()) as u64;
            }
            return raw as u64;
        }
        // the correction is undefined once the raw estimate reaches 2^32
        if raw <= TWO_POW_32 / 30.0 || raw >= TWO_POW_32 {
            return raw as u64;
        }
        (-TWO_POW_32 * (1.0 - raw / TWO_POW_32).ln()) as u64
    }

    /// Serialize slots into the sparse or dense byte form
    pub fn to_bytes(&self) -> Vec<u8> {
        let _guard = self.state.write();
        let slots = self.slots();
        encoding::encode(&slots, self.non_zero.load(Ordering::Acquire) as usize)
    }

    /// Return a copy of the slot values
    pub fn slots(&self) -> [u8; SLOTS] {
        std::array::from_fn(|i| self.slots[i].load(Ordering::Acquire))
    }

    /// Number of mutations not yet written to the backend
    #[inline]
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Record one mutation and return the new pending count
    #[inline]
    pub fn mark_dirty(&self) -> i64 {
        self.pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Subtract `flushed` written mutations and return what is still pending
    #[inline]
    pub fn mark_flushed(&self, flushed: i64) -> i64 {
        self.pending.fetch_sub(flushed, Ordering::AcqRel) - flushed
    }

    /// Exclusive access to expiry and deletion metadata
    #[inline]
    pub(crate) fn lock(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write()
    }
}

impl PartialEq for Sketch {
    /// Sketches are equal when they hold the same key and slot values
    fn eq(&self, rhs: &Self) -> bool {
        self.key == rhs.key && self.non_zero() == rhs.non_zero() && self.slots() == rhs.slots()
    }
}

impl Debug for Sketch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ key: {:?}, estimate: {}, non_zero: {}, pending: {} }}",
            self.key,
            self.estimate(),
            self.non_zero(),
            self.pending()
        )
    }
}

/// Parameter for bias correction
#[inline]
fn alpha() -> f64 {
    0.7213 / (1.0 + 1.079 / M)
}
