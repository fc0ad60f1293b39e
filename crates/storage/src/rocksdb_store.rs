use crate::*;

use async_trait::async_trait;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch,
    WriteOptions};
use std::sync::Arc;
use tokio::sync::Mutex;

/// RocksDB-backed [`Storage`]. Writes go through a WAL fsync when
/// `sync_write` is set, which is what the queue's durability contract
/// requires; tests turn it off for speed.
///
/// Clones share the database and the single write-batch handle.
#[derive(Clone)]
pub struct RocksStorage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    sync_write: bool,
    batch: Arc<Mutex<Option<WriteBatch>>>,
}

impl std::fmt::Debug for RocksStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStorage")
            .field("sync_write", &self.sync_write)
            .finish_non_exhaustive()
    }
}

impl RocksStorage {
    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_write); // fsync WAL before returning
        write_opts
    }

    pub fn open(path: &str, sync_write: bool) -> Result<Self, StorageError> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.increase_parallelism(cpus.min(8) as i32);
        opts.set_paranoid_checks(true);
        opts.set_write_buffer_size(64 * 1024 * 1024); // 64MB
        opts.set_max_write_buffer_number(3);
        opts.set_min_write_buffer_number_to_merge(1);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self {
            db: Arc::new(db),
            sync_write,
            batch: Arc::new(Mutex::new(None)),
        })
    }

    fn decode_key(key: &[u8]) -> Result<String, StorageError> {
        String::from_utf8(key.to_vec())
            .map_err(|_| StorageError::KeyDecode("non-utf8 key in scan".into()))
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.put_opt(key, value, &self.write_opts())?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.delete_opt(key, &self.write_opts())?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.db.get_pinned(key)?.is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            Direction::Forward,
        ));

        let mut out = Vec::new();

        for pair in iter {
            let (key, value) = pair?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((Self::decode_key(&key)?, value.to_vec()));
        }

        Ok(out)
    }

    async fn begin_batch(&self) -> Result<(), StorageError> {
        let mut slot = self.batch.lock().await;
        if slot.is_some() {
            return Err(StorageError::BatchAlreadyOpen);
        }
        *slot = Some(WriteBatch::default());
        Ok(())
    }

    async fn put_to_batch(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut slot = self.batch.lock().await;
        let batch = slot.as_mut().ok_or(StorageError::BatchNotOpen)?;
        batch.put(key, value);
        Ok(())
    }

    async fn delete_from_batch(&self, key: &str) -> Result<(), StorageError> {
        let mut slot = self.batch.lock().await;
        let batch = slot.as_mut().ok_or(StorageError::BatchNotOpen)?;
        batch.delete(key);
        Ok(())
    }

    async fn commit_batch(&self) -> Result<(), StorageError> {
        let batch = {
            let mut slot = self.batch.lock().await;
            slot.take().ok_or(StorageError::BatchNotOpen)?
        };
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn rollback_batch(&self) -> Result<(), StorageError> {
        let mut slot = self.batch.lock().await;
        slot.take().ok_or(StorageError::BatchNotOpen)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
