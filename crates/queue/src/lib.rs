pub mod batch;
pub mod session;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use durastash_storage::{Storage, StorageError};

use crate::batch::{batch_metadata_key, data_key, BatchManager};
use crate::session::{SessionManager, DEFAULT_HEARTBEAT_INTERVAL_MS};
use crate::types::{BatchMetadata, BatchStatus};

#[derive(thiserror::Error, Debug)]
pub enum StashError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("corrupted batch metadata: {0}")]
    CorruptedBatch(String),

    #[error("session initialization failed: {0}")]
    SessionInit(String),
}

/// One loaded batch: its identity, sequence range, and the payloads that
/// were still present at load time, in ascending sequence order. Gaps mean a
/// concurrent resave dropped those keys, not data loss.
#[derive(Debug, Clone)]
pub struct BatchLoadResult {
    pub batch_id: String,
    pub sequence_start: i64,
    pub sequence_end: i64,
    pub data: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct GroupStoreConfig {
    /// Batch window size for future saves.
    pub default_batch_size: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for GroupStoreConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

/// Top-level queue API: durable grouped FIFO saves drained as acknowledgable
/// batches.
///
/// Every public operation serializes on the coordinator mutex, which is what
/// keeps the per-group sequence counters and the open-batch map correct; the
/// session and batch managers carry their own locks only as backstops.
/// Internal failures collapse to `false`/empty returns and a `warn` log;
/// callers retry at their own cadence.
#[derive(Debug)]
pub struct GroupStore {
    storage: Arc<dyn Storage>,
    sessions: Arc<SessionManager>,
    batches: BatchManager,
    heartbeat_interval_ms: u64,
    state: Mutex<CoordinatorState>,
}

#[derive(Debug)]
struct CoordinatorState {
    group_sessions: HashMap<String, String>,
    group_sequence_counters: HashMap<String, i64>,
    // (group, window_start) -> open batch id, so saves landing in the same
    // window append to the same batch
    group_current_batch_ids: HashMap<(String, i64), String>,
    default_batch_size: usize,
    shut_down: bool,
}

fn next_sequence(state: &mut CoordinatorState, group_key: &str) -> i64 {
    match state.group_sequence_counters.get_mut(group_key) {
        Some(counter) => {
            *counter += 1;
            *counter
        }
        None => {
            state
                .group_sequence_counters
                .insert(group_key.to_string(), 0);
            0
        }
    }
}

/// Allocate `len` consecutive sequence numbers and return the first. The
/// counter lands on the last of them, so later saves stay disjoint from the
/// reserved range.
fn reserve_sequence_range(state: &mut CoordinatorState, group_key: &str, len: i64) -> i64 {
    let start = next_sequence(state, group_key);
    if let Some(counter) = state.group_sequence_counters.get_mut(group_key) {
        *counter = start + len - 1;
    }
    start
}

impl GroupStore {
    pub fn new(storage: impl Storage + 'static, config: GroupStoreConfig) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(storage);
        Self {
            sessions: Arc::new(SessionManager::new(Arc::clone(&storage))),
            batches: BatchManager::new(Arc::clone(&storage)),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            state: Mutex::new(CoordinatorState {
                group_sessions: HashMap::new(),
                group_sequence_counters: HashMap::new(),
                group_current_batch_ids: HashMap::new(),
                default_batch_size: config.default_batch_size.max(1),
                shut_down: false,
            }),
            storage,
        }
    }

    /// Ensure a session exists for the group and the heartbeat is running.
    pub async fn initialize_session(&self, group_key: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return false;
        }
        match self.init_session_locked(&mut state, group_key).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "session initialization failed");
                false
            }
        }
    }

    /// Terminate the group's session and forget its in-memory counters.
    pub async fn terminate_session(&self, group_key: &str) {
        let mut state = self.state.lock().await;
        if let Some(session_id) = state.group_sessions.get(group_key).cloned() {
            if let Err(err) = self.sessions.terminate_session(group_key, &session_id).await {
                tracing::warn!(group = group_key, error = %err, "session termination failed");
            }
        }
        state.group_sessions.remove(group_key);
        state.group_sequence_counters.remove(group_key);
        state
            .group_current_batch_ids
            .retain(|(group, _), _| group.as_str() != group_key);
    }

    /// Append one payload to the group. Assigns the next sequence number,
    /// opens the window's PENDING batch on first use, and persists the
    /// payload. Returns false when any persisted write fails.
    pub async fn save(&self, group_key: &str, data: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return false;
        }
        match self.save_locked(&mut state, group_key, data).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "save failed");
                false
            }
        }
    }

    /// Drain up to `max_batches` pending batches in FIFO order, flipping each
    /// to LOADED before reading its payloads. Batches another consumer
    /// already loaded are skipped; payload keys deleted by a concurrent
    /// resave are tolerated and simply absent from the result.
    pub async fn load_batch(&self, group_key: &str, max_batches: usize) -> Vec<BatchLoadResult> {
        let state = self.state.lock().await;
        if state.shut_down {
            return Vec::new();
        }
        let Some(session_id) = state.group_sessions.get(group_key).cloned() else {
            return Vec::new();
        };

        let batch_ids = match self
            .batches
            .get_loadable_batches(group_key, &session_id, max_batches)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "loadable batch scan failed");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for batch_id in batch_ids {
            match self
                .batches
                .mark_batch_as_loaded(group_key, &session_id, &batch_id)
                .await
            {
                Ok(true) => {}
                // another consumer won this batch
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(group = group_key, batch = %batch_id, error = %err,
                        "marking batch as loaded failed");
                    continue;
                }
            }

            match self
                .read_batch_data(group_key, &session_id, &batch_id)
                .await
            {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(group = group_key, batch = %batch_id, error = %err,
                        "reading batch payloads failed");
                }
            }
        }
        results
    }

    /// Read-only view of every payload currently stored for the group's
    /// session, in ascending sequence order. Performs no state changes and
    /// ignores batch status entirely.
    pub async fn peek_load(&self, group_key: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        if state.shut_down {
            return Vec::new();
        }
        let Some(session_id) = state.group_sessions.get(group_key).cloned() else {
            return Vec::new();
        };
        match self.peek_locked(group_key, &session_id).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "peek failed");
                Vec::new()
            }
        }
    }

    /// Atomically delete a batch's metadata record and every payload in its
    /// sequence range.
    pub async fn acknowledge_batch(&self, group_key: &str, batch_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return false;
        }
        let Some(session_id) = state.group_sessions.get(group_key).cloned() else {
            return false;
        };
        match self
            .batches
            .acknowledge_batch(group_key, &session_id, batch_id)
            .await
        {
            Ok(true) => {
                evict_open_batch(&mut state, batch_id);
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(group = group_key, batch = %batch_id, error = %err,
                    "acknowledge failed");
                false
            }
        }
    }

    /// Replace a LOADED batch with a fresh PENDING batch carrying
    /// `remaining`, deleting the original batch and all its payloads in the
    /// same atomic write. With nothing remaining this is an acknowledge.
    pub async fn resave_batch(
        &self,
        group_key: &str,
        batch_id: &str,
        remaining: &[Vec<u8>],
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return false;
        }
        match self
            .resave_locked(&mut state, group_key, batch_id, remaining)
            .await
        {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(group = group_key, batch = %batch_id, error = %err,
                    "resave failed");
                false
            }
        }
    }

    /// Flip every active session record in the group whose heartbeat is
    /// older than `timeout_ms` to terminated. Returns the count reclaimed.
    pub async fn cleanup_timeout_sessions(&self, group_key: &str, timeout_ms: i64) -> usize {
        let _state = self.state.lock().await;
        match self
            .sessions
            .cleanup_timeout_sessions(group_key, timeout_ms)
            .await
        {
            Ok(reclaimed) => reclaimed,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "session cleanup failed");
                0
            }
        }
    }

    pub async fn get_session_id(&self, group_key: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .group_sessions
            .get(group_key)
            .cloned()
    }

    /// Adjust the batch window size for future saves. Batches already open
    /// keep the window they were created with.
    pub async fn set_batch_size(&self, batch_size: usize) {
        if batch_size == 0 {
            return;
        }
        self.state.lock().await.default_batch_size = batch_size;
    }

    pub async fn get_batch_size(&self) -> usize {
        self.state.lock().await.default_batch_size
    }

    /// Terminate every initialized session, stop the heartbeat worker, and
    /// flush storage. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        let sessions: Vec<(String, String)> = state.group_sessions.drain().collect();
        for (group_key, session_id) in sessions {
            if let Err(err) = self
                .sessions
                .terminate_session(&group_key, &session_id)
                .await
            {
                tracing::warn!(group = %group_key, error = %err,
                    "session termination failed during shutdown");
            }
        }
        state.group_sequence_counters.clear();
        state.group_current_batch_ids.clear();
        drop(state);

        self.sessions.stop_heartbeat().await;

        if let Err(err) = self.storage.flush().await {
            tracing::warn!(error = %err, "storage flush failed during shutdown");
        }
    }

    async fn init_session_locked(
        &self,
        state: &mut CoordinatorState,
        group_key: &str,
    ) -> Result<String, StashError> {
        let session_id = self.sessions.initialize_session(group_key).await?;
        state
            .group_sessions
            .insert(group_key.to_string(), session_id.clone());
        // the new identity namespaces all future keys; counters and open
        // batches of a replaced session must not leak into it
        state.group_sequence_counters.remove(group_key);
        state
            .group_current_batch_ids
            .retain(|(group, _), _| group.as_str() != group_key);
        self.sessions
            .start_heartbeat(self.heartbeat_interval_ms)
            .await;
        Ok(session_id)
    }

    async fn save_locked(
        &self,
        state: &mut CoordinatorState,
        group_key: &str,
        data: &[u8],
    ) -> Result<(), StashError> {
        let session_id = match state.group_sessions.get(group_key) {
            Some(session_id) => session_id.clone(),
            None => self.init_session_locked(state, group_key).await?,
        };

        let sequence_id = next_sequence(state, group_key);
        let batch_size = state.default_batch_size as i64;
        let window_start = (sequence_id / batch_size) * batch_size;
        let window_end = window_start + batch_size - 1;

        let window = (group_key.to_string(), window_start);
        let batch_id = match state.group_current_batch_ids.get(&window) {
            Some(batch_id) => batch_id.clone(),
            None => {
                let batch_id = self
                    .batches
                    .create_batch(group_key, &session_id, window_start, window_end)
                    .await?;
                state.group_current_batch_ids.insert(window, batch_id.clone());
                batch_id
            }
        };

        let key = data_key(group_key, &session_id, &batch_id, sequence_id);
        self.storage.put(&key, data).await?;
        Ok(())
    }

    async fn read_batch_data(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
    ) -> Result<Option<BatchLoadResult>, StashError> {
        let Some(metadata) = self
            .batches
            .get_batch_metadata(group_key, session_id, batch_id)
            .await?
        else {
            return Ok(None);
        };

        let mut data = Vec::new();
        for seq in metadata.sequence_start..=metadata.sequence_end {
            let key = data_key(group_key, session_id, batch_id, seq);
            if let Some(value) = self.storage.get(&key).await? {
                data.push(value);
            }
        }

        Ok(Some(BatchLoadResult {
            batch_id: batch_id.to_string(),
            sequence_start: metadata.sequence_start,
            sequence_end: metadata.sequence_end,
            data,
        }))
    }

    async fn peek_locked(
        &self,
        group_key: &str,
        session_id: &str,
    ) -> Result<Vec<Vec<u8>>, StashError> {
        let prefix = format!("{group_key}:{session_id}:");
        let state_key = format!("{group_key}:{session_id}:state");
        let batch_prefix = format!("{group_key}:{session_id}:batch:");

        // Payload keys sort by batch id before sequence, so collect and
        // order by the embedded sequence number.
        let mut rows: Vec<(i64, Vec<u8>)> = Vec::new();
        for (key, value) in self.storage.scan_prefix(&prefix).await? {
            if key == state_key || key.starts_with(&batch_prefix) {
                continue;
            }
            let Some(seq) = key.rsplit(':').next().and_then(|s| s.parse::<i64>().ok()) else {
                continue;
            };
            rows.push((seq, value));
        }
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, value)| value).collect())
    }

    async fn resave_locked(
        &self,
        state: &mut CoordinatorState,
        group_key: &str,
        batch_id: &str,
        remaining: &[Vec<u8>],
    ) -> Result<bool, StashError> {
        let Some(session_id) = state.group_sessions.get(group_key).cloned() else {
            return Ok(false);
        };
        let Some(original) = self
            .batches
            .get_batch_metadata(group_key, &session_id, batch_id)
            .await?
        else {
            return Ok(false);
        };
        // only batches a consumer actually holds may be resaved
        if original.status != BatchStatus::Loaded {
            return Ok(false);
        }

        if remaining.is_empty() {
            let acked = self
                .batches
                .acknowledge_batch(group_key, &session_id, batch_id)
                .await?;
            if acked {
                evict_open_batch(state, batch_id);
            }
            return Ok(acked);
        }

        let new_start = reserve_sequence_range(state, group_key, remaining.len() as i64);
        let new_end = new_start + remaining.len() as i64 - 1;
        let new_batch_id = self
            .batches
            .create_batch(group_key, &session_id, new_start, new_end)
            .await?;

        self.storage.begin_batch().await?;
        let staged = self
            .stage_resave(
                group_key,
                &session_id,
                batch_id,
                &original,
                &new_batch_id,
                new_start,
                remaining,
            )
            .await;
        if let Err(err) = staged {
            let _ = self.storage.rollback_batch().await;
            return Err(err);
        }
        self.storage.commit_batch().await?;

        evict_open_batch(state, batch_id);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_resave(
        &self,
        group_key: &str,
        session_id: &str,
        batch_id: &str,
        original: &BatchMetadata,
        new_batch_id: &str,
        new_start: i64,
        remaining: &[Vec<u8>],
    ) -> Result<(), StashError> {
        for (i, payload) in remaining.iter().enumerate() {
            let key = data_key(group_key, session_id, new_batch_id, new_start + i as i64);
            self.storage.put_to_batch(&key, payload).await?;
        }
        for seq in original.sequence_start..=original.sequence_end {
            let key = data_key(group_key, session_id, batch_id, seq);
            self.storage.delete_from_batch(&key).await?;
        }
        self.storage
            .delete_from_batch(&batch_metadata_key(group_key, session_id, batch_id))
            .await?;
        Ok(())
    }
}

/// Drop a deleted batch from the open-window map so the next save in that
/// window opens a fresh PENDING batch instead of writing under a dead id.
fn evict_open_batch(state: &mut CoordinatorState, batch_id: &str) {
    state
        .group_current_batch_ids
        .retain(|_, open| open.as_str() != batch_id);
}
