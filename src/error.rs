//! Error types returned by the container, its sketches and persistence backends.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while decoding a serialized sketch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("serialized sketch is empty")]
    Empty,
    #[error("invalid length {len} for serialized sketch with leading byte {marker:#04x}")]
    InvalidLength { marker: u8, len: usize },
    #[error("sparse sketch declares {0} slots, at most 80 are allowed")]
    SparseCountTooLarge(usize),
    #[error("sparse sketch slot indices are not strictly increasing at position {position}")]
    UnsortedIndex { position: usize },
    #[error("slot {index} holds invalid rank {rank}")]
    InvalidRank { index: usize, rank: u8 },
}

/// Errors reported by a persistence backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend has been stopped")]
    Stopped,
}

/// Errors returned by container operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("deletion of key {key} was not confirmed within {timeout:?}")]
    DeleteTimeout { key: String, timeout: Duration },
    #[error("deletion of key {key} was aborted before the backend confirmed it")]
    DeleteAborted { key: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
