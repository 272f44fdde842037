//! The byte-store contract shared by all cache backends.

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Empty buffers are never cached; an empty body is always a failed
    /// retrieval in disguise.
    #[error("Refusing to store an empty buffer for key {0}")]
    EmptyPayload(String),

    /// The backing medium failed.
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key-value store of raw byte buffers, keyed by resource URL or name.
///
/// All operations are async so filesystem-backed implementations never
/// block the control thread. Implementations must reject empty payloads
/// on [`ByteStore::put`].
pub trait ByteStore: Send + Sync {
    /// Look up a key. `Ok(None)` means absent.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Store a buffer under a key, replacing any previous value.
    fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Whether a key is present.
    fn contains(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Delete one entry. Returns whether it existed.
    fn remove(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Delete every entry.
    fn clear(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Total stored payload size in bytes.
    fn total_size(&self) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;
}

/// Shared empty-payload guard for `put` implementations.
pub(crate) fn ensure_not_empty(key: &str, bytes: &[u8]) -> Result<(), StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::EmptyPayload(key.to_string()));
    }
    Ok(())
}
