use std::sync::Arc;

use tokio::sync::Mutex;

use durastash_storage::Storage;
use durastash_util::{id, unix_millis};

use crate::types::{BatchMetadata, BatchStatus};
use crate::StashError;

pub fn batch_metadata_key(group_key: &str, session_id: &str, batch_id: &str) -> String {
    format!("{group_key}:{session_id}:batch:{batch_id}")
}

/// Payload key for one sequence number. The sequence is rendered as exactly
/// 20 zero-padded decimal digits so lexicographic key order equals numeric
/// sequence order.
pub fn data_key(group_key: &str, session_id: &str, batch_id: &str, sequence_id: i64) -> String {
    format!("{group_key}:{session_id}:{batch_id}:{sequence_id:020}")
}

/// All payload keys in a batch's sequence range, in sequence order.
pub fn data_keys(
    group_key: &str,
    session_id: &str,
    batch_id: &str,
    sequence_start: i64,
    sequence_end: i64,
) -> Vec<String> {
    (sequence_start..=sequence_end)
        .map(|seq| data_key(group_key, session_id, batch_id, seq))
        .collect()
}

/// Owns the batch metadata state machine: PENDING on create, LOADED at most
/// once, deleted together with its payload range on acknowledge.
#[derive(Debug)]
pub struct BatchManager {
    storage: Arc<dyn Storage>,
    // Serializes metadata read-modify-write cycles. The coordinator already
    // serializes every path that reaches here, so this is a backstop for
    // callers using the manager directly.
    mutex: Mutex<()>,
}

impl BatchManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            mutex: Mutex::new(()),
        }
    }

    /// Persist a fresh PENDING batch covering `[sequence_start, sequence_end]`
    /// and return its identifier.
    pub async fn create_batch(
        &self,
        group_key: &str,
        session_id: &str,
        sequence_start: i64,
        sequence_end: i64,
    ) -> Result<String, StashError> {
        let _guard = self.mutex.lock().await;

        let batch_id = id::new_id();
        let metadata = BatchMetadata {
            batch_id: batch_id.clone(),
            sequence_start,
            sequence_end,
            status: BatchStatus::Pending,
            created_at: unix_millis() as i64,
            loaded_at: 0,
        };

        let key = batch_metadata_key(group_key, session_id, &batch_id);
        self.storage
            .put(&key, &serde_json::to_vec(&metadata)?)
            .await?;
        Ok(batch_id)
    }

    /// Point lookup of a batch's metadata. An unparseable record is a miss.
    pub async fn get_batch_metadata(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
    ) -> Result<Option<BatchMetadata>, StashError> {
        let _guard = self.mutex.lock().await;

        let key = batch_metadata_key(group_key, session_id, batch_id);
        let Some(raw) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(_) => {
                tracing::warn!(batch = batch_id, "unparseable batch metadata");
                Ok(None)
            }
        }
    }

    /// Flip a pending batch to loaded, stamping `loaded_at`.
    ///
    /// Returns `Ok(false)` when the record is already loaded; that gate is
    /// what makes a batch loadable at most once. A missing or corrupt record
    /// is an error, not a skip.
    pub async fn mark_batch_as_loaded(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
    ) -> Result<bool, StashError> {
        let _guard = self.mutex.lock().await;

        let key = batch_metadata_key(group_key, session_id, batch_id);
        let raw = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| StashError::BatchNotFound(batch_id.to_string()))?;
        let mut metadata: BatchMetadata = serde_json::from_slice(&raw)
            .map_err(|_| StashError::CorruptedBatch(batch_id.to_string()))?;

        if metadata.status == BatchStatus::Loaded {
            return Ok(false);
        }

        metadata.status = BatchStatus::Loaded;
        metadata.loaded_at = unix_millis() as i64;
        self.storage
            .put(&key, &serde_json::to_vec(&metadata)?)
            .await?;
        Ok(true)
    }

    /// Delete a batch's metadata record and every payload key in its range
    /// in one atomic write batch. Returns false when the batch is gone.
    pub async fn acknowledge_batch(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
    ) -> Result<bool, StashError> {
        let _guard = self.mutex.lock().await;

        let key = batch_metadata_key(group_key, session_id, batch_id);
        let Some(raw) = self.storage.get(&key).await? else {
            return Ok(false);
        };
        let Ok(metadata) = serde_json::from_slice::<BatchMetadata>(&raw) else {
            return Ok(false);
        };

        self.storage.begin_batch().await?;
        let staged = self
            .stage_batch_deletion(group_key, session_id, batch_id, &metadata)
            .await;
        if let Err(err) = staged {
            let _ = self.storage.rollback_batch().await;
            return Err(err);
        }
        self.storage.commit_batch().await?;
        Ok(true)
    }

    async fn stage_batch_deletion(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
        metadata: &BatchMetadata,
    ) -> Result<(), StashError> {
        self.storage
            .delete_from_batch(&batch_metadata_key(group_key, session_id, batch_id))
            .await?;
        for key in data_keys(
            group_key,
            session_id,
            batch_id,
            metadata.sequence_start,
            metadata.sequence_end,
        ) {
            self.storage.delete_from_batch(&key).await?;
        }
        Ok(())
    }

    /// Pending batch ids for the session in FIFO order (ascending
    /// `sequence_start`, ties broken by batch id, which is creation order),
    /// at most `max`. Corrupt records are skipped.
    pub async fn get_loadable_batches(
        &self,
        group_key: &str,
        session_id: &str,
        max: usize,
    ) -> Result<Vec<String>, StashError> {
        let _guard = self.mutex.lock().await;

        let prefix = format!("{group_key}:{session_id}:batch:");
        let entries = self.storage.scan_prefix(&prefix).await?;

        let mut pending: Vec<(i64, String)> = Vec::new();
        for (key, value) in entries {
            let Ok(metadata) = serde_json::from_slice::<BatchMetadata>(&value) else {
                tracing::warn!(key = %key, "skipping unparseable batch metadata");
                continue;
            };
            if metadata.status == BatchStatus::Pending {
                pending.push((metadata.sequence_start, metadata.batch_id));
            }
        }

        pending.sort();
        Ok(pending
            .into_iter()
            .take(max)
            .map(|(_, batch_id)| batch_id)
            .collect())
    }

    /// First batch whose sequence range contains `sequence_id`. Diagnostic
    /// range lookup; not on the hot path.
    pub async fn find_batch_id_by_sequence_id(
        &self,
        group_key: &str,
        session_id: &str,
        sequence_id: i64,
    ) -> Result<Option<String>, StashError> {
        let _guard = self.mutex.lock().await;

        let prefix = format!("{group_key}:{session_id}:batch:");
        let entries = self.storage.scan_prefix(&prefix).await?;

        for (_, value) in entries {
            let Ok(metadata) = serde_json::from_slice::<BatchMetadata>(&value) else {
                continue;
            };
            if sequence_id >= metadata.sequence_start && sequence_id <= metadata.sequence_end {
                return Ok(Some(metadata.batch_id));
            }
        }
        Ok(None)
    }

    /// Payload key for a sequence number whose batch is not known up front.
    /// `None` when no batch covers the sequence.
    pub async fn data_key_by_sequence_id(
        &self,
        group_key: &str,
        session_id: &str,
        sequence_id: i64,
    ) -> Result<Option<String>, StashError> {
        let Some(batch_id) = self
            .find_batch_id_by_sequence_id(group_key, session_id, sequence_id)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(data_key(group_key, session_id, &batch_id, sequence_id)))
    }
}
