use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use durastash_storage::Storage;
use durastash_util::{id, unix_millis};

use crate::types::{SessionState, SessionStatus};
use crate::StashError;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

pub fn session_state_key(group_key: &str, session_id: &str) -> String {
    format!("{group_key}:{session_id}:state")
}

/// Issues the process's session identity per group and keeps its liveness
/// record fresh via a background heartbeat.
///
/// Only one `(group, session)` pair is held at a time; initializing a session
/// for another group replaces it. The coordinator remembers older ids per
/// group and passes them back in for termination.
#[derive(Debug)]
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    current: Mutex<CurrentSession>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

#[derive(Debug, Default)]
struct CurrentSession {
    session_id: Option<String>,
    group_key: Option<String>,
}

#[derive(Debug)]
struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            current: Mutex::new(CurrentSession::default()),
            heartbeat: Mutex::new(None),
        }
    }

    /// Issue a fresh session identity for `group_key` and persist its state
    /// record. Replaces whatever identity this manager held before.
    pub async fn initialize_session(&self, group_key: &str) -> Result<String, StashError> {
        let session_id = id::new_id();
        let now = unix_millis() as i64;

        let state = SessionState {
            session_id: session_id.clone(),
            process_id: std::process::id() as i64,
            started_at: now,
            last_heartbeat: now,
            status: SessionStatus::Active,
        };

        let key = session_state_key(group_key, &session_id);
        let value = serde_json::to_vec(&state)?;
        self.storage
            .put(&key, &value)
            .await
            .map_err(|e| StashError::SessionInit(e.to_string()))?;

        let mut current = self.current.lock().await;
        current.session_id = Some(session_id.clone());
        current.group_key = Some(group_key.to_string());
        Ok(session_id)
    }

    /// Flip the session's persisted record to terminated and forget the
    /// identity if it is the one currently held. Absent record is a no-op,
    /// so terminating twice is fine.
    pub async fn terminate_session(
        &self,
        group_key: &str,
        session_id: &str,
    ) -> Result<(), StashError> {
        let key = session_state_key(group_key, session_id);
        if let Some(raw) = self.storage.get(&key).await? {
            if let Ok(mut state) = serde_json::from_slice::<SessionState>(&raw) {
                state.status = SessionStatus::Terminated;
                state.last_heartbeat = unix_millis() as i64;
                self.storage.put(&key, &serde_json::to_vec(&state)?).await?;
            }
        }

        let mut current = self.current.lock().await;
        if current.session_id.as_deref() == Some(session_id) {
            current.session_id = None;
            current.group_key = None;
        }
        Ok(())
    }

    /// Best-effort heartbeat write for the currently held session. A failure
    /// here only shows up as timeout reclamation by other observers.
    pub async fn update_heartbeat(&self, group_key: &str) -> bool {
        let session_id = {
            let current = self.current.lock().await;
            match &current.session_id {
                Some(id) => id.clone(),
                None => return false,
            }
        };

        let key = session_state_key(group_key, &session_id);
        let raw = match self.storage.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "heartbeat read failed");
                return false;
            }
        };

        let mut state: SessionState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(_) => return false,
        };
        state.last_heartbeat = unix_millis() as i64;

        let Ok(value) = serde_json::to_vec(&state) else {
            return false;
        };
        match self.storage.put(&key, &value).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(group = group_key, error = %err, "heartbeat write failed");
                false
            }
        }
    }

    /// True iff the session's record exists, parses, and is `active`.
    pub async fn is_session_active(&self, group_key: &str, session_id: &str) -> bool {
        let key = session_state_key(group_key, session_id);
        let raw = match self.storage.get(&key).await {
            Ok(Some(raw)) => raw,
            _ => return false,
        };
        match serde_json::from_slice::<SessionState>(&raw) {
            Ok(state) => state.status == SessionStatus::Active,
            Err(_) => false,
        }
    }

    /// Flip every active session record in the group whose heartbeat is
    /// older than `timeout_ms` to terminated. Returns the count reclaimed.
    pub async fn cleanup_timeout_sessions(
        &self,
        group_key: &str,
        timeout_ms: i64,
    ) -> Result<usize, StashError> {
        let prefix = format!("{group_key}:");
        let entries = self.storage.scan_prefix(&prefix).await?;

        let now = unix_millis() as i64;
        let mut reclaimed = 0;

        for (key, value) in entries {
            if !key.ends_with(":state") {
                continue;
            }
            let Ok(mut state) = serde_json::from_slice::<SessionState>(&value) else {
                continue;
            };
            if state.status != SessionStatus::Active {
                continue;
            }
            if now - state.last_heartbeat > timeout_ms {
                state.status = SessionStatus::Terminated;
                state.last_heartbeat = now;
                self.storage.put(&key, &serde_json::to_vec(&state)?).await?;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.current.lock().await.session_id.clone()
    }

    /// Start the background heartbeat worker. Idempotent; the first call
    /// wins and later calls are no-ops until the worker is stopped.
    pub async fn start_heartbeat(self: &Arc<Self>, interval_ms: u64) {
        let mut slot = self.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(interval_ms.max(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let group_key = {
                    let current = manager.current.lock().await;
                    current.group_key.clone()
                };
                if let Some(group_key) = group_key {
                    manager.update_heartbeat(&group_key).await;
                }
            }
        });

        *slot = Some(HeartbeatTask { cancel, handle });
    }

    /// Stop the heartbeat and wait for the worker to exit. Idempotent.
    pub async fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }
}
