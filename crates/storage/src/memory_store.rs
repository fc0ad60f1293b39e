use crate::*;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug)]
enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// In-memory [`Storage`] over a sorted map. Same contract as the RocksDB
/// backend (including the single write-batch handle); used by tests that
/// don't care about on-disk durability.
///
/// Clones share the map and the write-batch handle, like clones of the
/// RocksDB backend share the database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: std::sync::Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    batch: Mutex<Option<Vec<BatchOp>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.data.lock().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.data.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.data.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.inner.data.lock().await.contains_key(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let data = self.inner.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn begin_batch(&self) -> Result<(), StorageError> {
        let mut slot = self.inner.batch.lock().await;
        if slot.is_some() {
            return Err(StorageError::BatchAlreadyOpen);
        }
        *slot = Some(Vec::new());
        Ok(())
    }

    async fn put_to_batch(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut slot = self.inner.batch.lock().await;
        let ops = slot.as_mut().ok_or(StorageError::BatchNotOpen)?;
        ops.push(BatchOp::Put(key.to_string(), value.to_vec()));
        Ok(())
    }

    async fn delete_from_batch(&self, key: &str) -> Result<(), StorageError> {
        let mut slot = self.inner.batch.lock().await;
        let ops = slot.as_mut().ok_or(StorageError::BatchNotOpen)?;
        ops.push(BatchOp::Delete(key.to_string()));
        Ok(())
    }

    async fn commit_batch(&self) -> Result<(), StorageError> {
        let ops = {
            let mut slot = self.inner.batch.lock().await;
            slot.take().ok_or(StorageError::BatchNotOpen)?
        };
        let mut data = self.inner.data.lock().await;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    data.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback_batch(&self) -> Result<(), StorageError> {
        let mut slot = self.inner.batch.lock().await;
        slot.take().ok_or(StorageError::BatchNotOpen)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
