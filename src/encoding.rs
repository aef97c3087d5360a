//! Binary encodings of a sketch's slot array.
//!
//! A sketch is serialized in one of two forms, chosen by the number of non-zero slots:
//!
//! ## Sparse form (at most [`SPARSE_MAX_SLOTS`] non-zero slots)
//! - byte 0          - number `N` of non-zero slots
//! - bytes 1..N+1    - slot indices in increasing order
//! - bytes N+1..2N+1 - slot values, `value[i]` belongs to `index[i]`
//!
//! ## Dense form
//! - byte 0          - marker [`DENSE_MARKER`]
//! - bytes 1..161    - all 256 slot values packed into 5 bits each, least significant bit first
//!
//! Both shapes have an odd length: any other length for a given leading byte is rejected.

use crate::error::DecodeError;

/// Number of slots in every sketch
pub const SLOTS: usize = 256;
/// Largest rank a slot can hold: 24 rank bits plus one
pub const MAX_RANK: u8 = 25;
/// Maximum number of non-zero slots stored in sparse form
pub const SPARSE_MAX_SLOTS: usize = 80;
/// Leading byte of the dense form
pub const DENSE_MARKER: u8 = 0xff;
/// Bits per packed slot value in dense form
const REGISTER_BITS: usize = 5;
/// Length of the dense form including the marker byte
pub const DENSE_LEN: usize = (SLOTS * REGISTER_BITS).div_ceil(8) + 1;

/// Serialized shape of a sketch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Sparse,
    Dense,
}

impl Encoding {
    /// Return the encoding used for a sketch with `non_zero` occupied slots
    #[inline]
    pub fn select(non_zero: usize) -> Self {
        if non_zero <= SPARSE_MAX_SLOTS {
            Encoding::Sparse
        } else {
            Encoding::Dense
        }
    }

    /// Return the serialized length for `non_zero` occupied slots
    #[inline]
    pub fn encoded_len(&self, non_zero: usize) -> usize {
        match self {
            Encoding::Sparse => 2 * non_zero + 1,
            Encoding::Dense => DENSE_LEN,
        }
    }

    /// Detect the encoding of serialized data from its leading byte
    #[inline]
    pub fn detect(data: &[u8]) -> Result<Self, DecodeError> {
        match data.first() {
            None => Err(DecodeError::Empty),
            Some(&DENSE_MARKER) => Ok(Encoding::Dense),
            Some(_) => Ok(Encoding::Sparse),
        }
    }
}

/// Slot values recovered from serialized data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub slots: [u8; SLOTS],
    pub non_zero: u32,
}

/// Encode `slots` holding `non_zero` occupied slots
pub fn encode(slots: &[u8; SLOTS], non_zero: usize) -> Vec<u8> {
    let encoding = Encoding::select(non_zero);
    let mut out = vec![0u8; encoding.encoded_len(non_zero)];
    match encoding {
        Encoding::Sparse => {
            out[0] = non_zero as u8;
            let mut pos = 0;
            for (idx, &rank) in slots.iter().enumerate() {
                if rank == 0 {
                    continue;
                }
                // `non_zero` may lag behind a concurrent writer, never write past the header
                if pos == non_zero {
                    break;
                }
                out[1 + pos] = idx as u8;
                out[1 + non_zero + pos] = rank;
                pos += 1;
            }
        }
        Encoding::Dense => {
            out[0] = DENSE_MARKER;
            for (idx, &rank) in slots.iter().enumerate() {
                set_register(&mut out[1..], idx, rank);
            }
        }
    }
    out
}

/// Decode serialized data produced by [`encode`]
pub fn decode(data: &[u8]) -> Result<Decoded, DecodeError> {
    let mut decoded = Decoded {
        slots: [0u8; SLOTS],
        non_zero: 0,
    };

    match Encoding::detect(data)? {
        Encoding::Sparse => {
            let n = data[0] as usize;
            if n > SPARSE_MAX_SLOTS {
                return Err(DecodeError::SparseCountTooLarge(n));
            }
            if data.len() != Encoding::Sparse.encoded_len(n) {
                return Err(DecodeError::InvalidLength {
                    marker: data[0],
                    len: data.len(),
                });
            }
            let (indices, ranks) = data[1..].split_at(n);
            for (pos, (&idx, &rank)) in indices.iter().zip(ranks).enumerate() {
                if pos > 0 && idx <= indices[pos - 1] {
                    return Err(DecodeError::UnsortedIndex { position: pos });
                }
                if rank == 0 || rank > MAX_RANK {
                    return Err(DecodeError::InvalidRank {
                        index: idx as usize,
                        rank,
                    });
                }
                decoded.slots[idx as usize] = rank;
            }
            decoded.non_zero = n as u32;
        }
        Encoding::Dense => {
            if data.len() != DENSE_LEN {
                return Err(DecodeError::InvalidLength {
                    marker: data[0],
                    len: data.len(),
                });
            }
            let packed = &data[1..];
            for idx in 0..SLOTS {
                let rank = get_register(packed, idx);
                if rank > MAX_RANK {
                    return Err(DecodeError::InvalidRank { index: idx, rank });
                }
                decoded.slots[idx] = rank;
                decoded.non_zero += u32::from(rank != 0);
            }
        }
    }

    Ok(decoded)
}

/// Get the 5-bit register `idx` from packed bytes
#[inline]
fn get_register(data: &[u8], idx: usize) -> u8 {
    let bit_idx = idx * REGISTER_BITS;
    let byte_idx = bit_idx / 8;
    let bit_pos = bit_idx % 8;
    let bits_1 = REGISTER_BITS.min(8 - bit_pos);
    let bits_2 = REGISTER_BITS - bits_1;
    let mask_1 = (1u16 << bits_1) - 1;
    let mask_2 = (1u16 << bits_2) - 1;

    let mut value = (u16::from(data[byte_idx]) >> bit_pos) & mask_1;
    if bits_2 > 0 {
        value |= (u16::from(data[byte_idx + 1]) & mask_2) << bits_1;
    }
    value as u8
}

/// Set the 5-bit register `idx` in packed bytes to `rank`
#[inline]
fn set_register(data: &mut [u8], idx: usize, rank: u8) {
    let bit_idx = idx * REGISTER_BITS;
    let byte_idx = bit_idx / 8;
    let bit_pos = bit_idx % 8;
    let bits_1 = REGISTER_BITS.min(8 - bit_pos);
    let bits_2 = REGISTER_BITS - bits_1;
    let mask_1 = ((1u16 << bits_1) - 1) as u8;
    let mask_2 = ((1u16 << bits_2) - 1) as u8;

    data[byte_idx] &= !(mask_1 << bit_pos);
    data[byte_idx] |= (rank & mask_1) << bit_pos;
    if bits_2 > 0 {
        data[byte_idx + 1] &= !mask_2;
        data[byte_idx + 1] |= (rank >> bits_1) & mask_2;
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use test_case::test_case;

    fn random_slots(non_zero: usize, seed: u64) -> [u8; SLOTS] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut slots = [0u8; SLOTS];
        let mut filled = 0;
        while filled < non_zero {
            let idx = rng.gen_range(0..SLOTS);
            if slots[idx] == 0 {
                slots[idx] = rng.gen_range(1..=MAX_RANK);
                filled += 1;
            }
        }
        slots
    }

    #[test_case(0 => (Encoding::Sparse, 1))]
    #[test_case(1 => (Encoding::Sparse, 3))]
    #[test_case(80 => (Encoding::Sparse, 161))]
    #[test_case(81 => (Encoding::Dense, 161))]
    #[test_case(256 => (Encoding::Dense, 161))]
    fn test_encoded_shape(non_zero: usize) -> (Encoding, usize) {
        let encoded = encode(&random_slots(non_zero, 7), non_zero);
        (Encoding::detect(&encoded).unwrap(), encoded.len())
    }

    #[test_case(0)]
    #[test_case(1)]
    #[test_case(80)]
    #[test_case(81)]
    #[test_case(200)]
    #[test_case(256)]
    fn test_decode_restores_slots(non_zero: usize) {
        let slots = random_slots(non_zero, non_zero as u64);
        let decoded = decode(&encode(&slots, non_zero)).unwrap();
        assert_eq!(decoded.slots, slots);
        assert_eq!(decoded.non_zero as usize, non_zero);
    }

    #[test]
    fn test_sparse_layout() {
        let mut slots = [0u8; SLOTS];
        slots[3] = 2;
        slots[200] = 7;
        assert_eq!(encode(&slots, 2), vec![2, 3, 200, 2, 7]);
    }

    #[test]
    fn test_dense_packing_is_lsb_first() {
        let mut slots = [1u8; SLOTS];
        slots[0] = 0b10101;
        slots[1] = 0b00011;
        let encoded = encode(&slots, SLOTS);
        assert_eq!(encoded[0], DENSE_MARKER);
        // slot 0 in bits 0..5 of byte 1, low 3 bits of slot 1 in bits 5..8
        assert_eq!(encoded[1], 0b0111_0101);
        assert_eq!(encoded[2] & 0b11, 0b00);
    }

    #[test_case(&[] => DecodeError::Empty; "empty")]
    #[test_case(&[2, 1, 2] => DecodeError::InvalidLength { marker: 2, len: 3 }; "short sparse")]
    #[test_case(&[1, 1, 2, 3] => DecodeError::InvalidLength { marker: 1, len: 4 }; "even length")]
    #[test_case(&[0xff, 0, 0] => DecodeError::InvalidLength { marker: 0xff, len: 3 }; "short dense")]
    #[test_case(&[81] => DecodeError::SparseCountTooLarge(81); "sparse count")]
    #[test_case(&[2, 9, 4, 1, 1] => DecodeError::UnsortedIndex { position: 1 }; "unsorted")]
    #[test_case(&[2, 4, 4, 1, 1] => DecodeError::UnsortedIndex { position: 1 }; "duplicate")]
    #[test_case(&[1, 4, 0] => DecodeError::InvalidRank { index: 4, rank: 0 }; "zero rank")]
    #[test_case(&[1, 4, 26] => DecodeError::InvalidRank { index: 4, rank: 26 }; "rank overflow")]
    fn test_decode_rejects(data: &[u8]) -> DecodeError {
        decode(data).unwrap_err()
    }

    #[test]
    fn test_decode_rejects_dense_rank_overflow() {
        let mut data = vec![0u8; DENSE_LEN];
        data[0] = DENSE_MARKER;
        // slot 0 = 31
        data[1] = 0b0001_1111;
        assert_eq!(
            decode(&data).unwrap_err(),
            DecodeError::InvalidRank { index: 0, rank: 31 }
        );
    }
}
