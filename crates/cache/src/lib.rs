//! Byte cache for fetched resources (model weights, sample assets).
//!
//! A [`ByteStore`] is a key-value store of raw byte buffers, consulted
//! before any network retrieval. [`CachedFetcher`] wraps a store and an
//! injected [`Fetcher`] into the store-first, retry-with-backoff lookup
//! path the rest of the system uses.
//!
//! The retrieval function is always passed in explicitly; nothing in this
//! crate installs itself globally or intercepts ambient I/O.

pub mod fetch;
pub mod fs;
pub mod memory;
pub mod store;

pub use fetch::{CachedFetcher, FetchError, Fetcher};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use store::{ByteStore, StoreError};
