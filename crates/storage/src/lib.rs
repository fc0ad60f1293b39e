pub mod memory_store;
pub mod rocksdb_store;

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    #[error("a write batch is already open on this handle")]
    BatchAlreadyOpen,

    #[error("no write batch is open on this handle")]
    BatchNotOpen,

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

pub fn make_rocksdb_store(
    path: &str,
    sync_write: bool,
) -> Result<rocksdb_store::RocksStorage, StorageError> {
    rocksdb_store::RocksStorage::open(path, sync_write)
}

pub fn make_memory_store() -> memory_store::MemoryStorage {
    memory_store::MemoryStorage::new()
}

/// Ordered key-value contract the queue core is written against.
///
/// Implementations must make `put` durable before returning, keep
/// `scan_prefix` in lexicographic key order, and give read-your-writes
/// visibility within a single process. At most one write batch may be open
/// per handle; callers that build batches concurrently must serialize on
/// their own locks.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Durable upsert.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Point lookup. `None` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Idempotent delete.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Every pair whose key starts with `prefix`, in ascending key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Open this handle's write batch. Fails while another batch is open.
    async fn begin_batch(&self) -> Result<(), StorageError>;

    async fn put_to_batch(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn delete_from_batch(&self, key: &str) -> Result<(), StorageError>;

    /// All-or-nothing durable commit of the open batch.
    async fn commit_batch(&self) -> Result<(), StorageError>;

    /// Drop the open batch without applying any of it.
    async fn rollback_batch(&self) -> Result<(), StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;
}
