//! `hll-container` keeps one HyperLogLog sketch per key and answers "how many distinct values
//! were added under this key" with bounded memory per key.
//!
//! Keys are spread over a power-of-two number of shards, may carry an expiry evicted in coarse
//! time buckets, and are optionally written back to a pluggable [`Backend`] by a background
//! pipeline that batches dirty sketches.
//!
//! ```no_run
//! # async fn run() -> hll_container::Result<()> {
//! use std::sync::Arc;
//! use hll_container::{Container, MemoryBackend};
//!
//! let container = Container::builder()
//!     .backend(Arc::new(MemoryBackend::new()))
//!     .open()
//!     .await?;
//! container.add_log("visitors", Some(b"alice".as_slice()), 3_600);
//! assert_eq!(container.get_cardinality("visitors"), 1);
//! container.shutdown().await?;
//! # Ok(())
//! # }
//! ```
pub mod backend;
pub mod config;
pub mod container;
pub mod encoding;
pub mod error;
pub mod expiry;
pub mod hash;
pub mod pipeline;
#[cfg(feature = "with_serde")]
mod serde;
pub mod shard;
pub mod sketch;

pub use backend::{Backend, MemoryBackend};
pub use config::{Config, RetryPolicy};
pub use container::{Builder, Container};
pub use error::{BackendError, DecodeError, Error, Result};
pub use hash::{HashKind, Hashing};
pub use sketch::Sketch;
