//! Non-cryptographic hash functions used by the container.
//!
//! Two hashes are needed:
//! - a 32-bit hash of every inserted value, whose top 8 bits select a sketch slot
//!   and whose lower 24 bits provide the rank;
//! - a 64-bit hash of every key, used to route the key to its shard.
//!
//! `Murmur3` is the default family: MurmurHash3 x86_32 for values and MurmurHash64A for keys,
//! both seeded with [`SEED`]. Persisted sketches depend on the value hash, so switching
//! the family of an existing data set invalidates the counts of restored keys.

use enum_dispatch::enum_dispatch;

/// Seed used by every hash computed by the container
pub const SEED: u32 = 32;

/// Hash function family used for values and keys.
#[enum_dispatch]
pub trait HashFunction {
    /// 32-bit hash of an inserted value
    fn hash32(&self, data: &[u8]) -> u32;
    /// 64-bit hash of a key
    fn hash64(&self, data: &[u8]) -> u64;
}

/// MurmurHash3 (x86, 32-bit) for values and MurmurHash64A for keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Murmur3;

/// WyHash for both values and keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WyHash;

impl HashFunction for Murmur3 {
    #[inline]
    fn hash32(&self, data: &[u8]) -> u32 {
        murmur3_32(data, SEED)
    }

    #[inline]
    fn hash64(&self, data: &[u8]) -> u64 {
        murmur64a(data, u64::from(SEED))
    }
}

impl HashFunction for WyHash {
    #[inline]
    fn hash32(&self, data: &[u8]) -> u32 {
        let h = wyhash::wyhash(data, u64::from(SEED));
        (h ^ (h >> 32)) as u32
    }

    #[inline]
    fn hash64(&self, data: &[u8]) -> u64 {
        wyhash::wyhash(data, u64::from(SEED))
    }
}

/// Hash function selected by the container configuration
#[enum_dispatch(HashFunction)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hashing {
    Murmur3(Murmur3),
    WyHash(WyHash),
}

impl Default for Hashing {
    fn default() -> Self {
        Hashing::Murmur3(Murmur3)
    }
}

/// Configurable name of a [`Hashing`] family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "with_serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "with_serde", serde(rename_all = "lowercase"))]
pub enum HashKind {
    #[default]
    Murmur3,
    WyHash,
}

impl From<HashKind> for Hashing {
    fn from(kind: HashKind) -> Self {
        match kind {
            HashKind::Murmur3 => Hashing::Murmur3(Murmur3),
            HashKind::WyHash => Hashing::WyHash(WyHash),
        }
    }
}

/// MurmurHash3 x86 32-bit
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= u32::from(b) << (8 * i);
        }
        h ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// MurmurHash64A
pub fn murmur64a(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let len = data.len() as u64;
    let mut h = (seed & 0xffff_ffff) ^ len.wrapping_mul(M);
    let chunks = data.chunks_exact(8);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(buf);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate() {
            h ^= u64::from(b) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^ (h >> R)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;

    // Reference values of MurmurHash3_x86_32
    #[test_case(b"", 0 => 0)]
    #[test_case(b"", 1 => 0x514e_28b7)]
    #[test_case(b"", 0xffff_ffff => 0x81f1_6f39)]
    #[test_case(b"\x00\x00\x00\x00", 0 => 0x2362_f9de)]
    #[test_case(b"\x21\x43\x65\x87", 0 => 0xf55b_516b)]
    #[test_case(b"\x21\x43\x65", 0 => 0x7e4a_8634)]
    #[test_case(b"\x21\x43", 0 => 0xa0f7_b07a)]
    #[test_case(b"\x21", 0 => 0x7266_1cf4)]
    #[test_case(b"Hello, world!", 1234 => 0xfaf6_cdb3)]
    fn test_murmur3_32(data: &[u8], seed: u32) -> u32 {
        murmur3_32(data, seed)
    }

    #[test]
    fn test_murmur64a_is_deterministic() {
        let a = murmur64a(b"user:42", 32);
        assert_eq!(a, murmur64a(b"user:42", 32));
        assert_ne!(a, murmur64a(b"user:43", 32));
        assert_ne!(a, murmur64a(b"user:42", 33));
    }

    #[test]
    fn test_murmur64a_covers_tail_lengths() {
        let data = b"0123456789abcdef";
        let hashes: Vec<u64> = (0..=data.len()).map(|n| murmur64a(&data[..n], 0)).collect();
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test_case(HashKind::Murmur3)]
    #[test_case(HashKind::WyHash)]
    fn test_hashing_dispatch(kind: HashKind) {
        let hashing = Hashing::from(kind);
        assert_eq!(hashing.hash32(b"value"), hashing.hash32(b"value"));
        assert_eq!(hashing.hash64(b"key"), hashing.hash64(b"key"));
        assert_ne!(hashing.hash32(b"value"), hashing.hash32(b"other value"));
    }

    #[test]
    fn test_default_is_murmur3() {
        let hashing = Hashing::default();
        assert_eq!(hashing.hash32(b"abc"), murmur3_32(b"abc", SEED));
        assert_eq!(hashing.hash64(b"abc"), murmur64a(b"abc", 32));
    }
}
