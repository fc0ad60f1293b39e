use serde::{Deserialize, Serialize};

/// Lifecycle states of a batch metadata record. A batch leaves the store
/// entirely on acknowledge, so `Acknowledged` only appears transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Loaded,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Terminated,
}

/// Persisted per-batch record, stored under `{group}:{session}:batch:{id}`.
///
/// `loaded_at` stays 0 until the batch is flipped to loaded and is omitted
/// from the encoded form while unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: String,
    pub sequence_start: i64,
    pub sequence_end: i64,
    pub status: BatchStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "unset")]
    pub loaded_at: i64,
}

/// Persisted session liveness record, stored under `{group}:{session}:state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub process_id: i64,
    pub started_at: i64,
    pub last_heartbeat: i64,
    pub status: SessionStatus,
}

fn unset(v: &i64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_metadata_round_trips() {
        let metadata = BatchMetadata {
            batch_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            sequence_start: 100,
            sequence_end: 199,
            status: BatchStatus::Loaded,
            created_at: 1_700_000_000_000,
            loaded_at: 1_700_000_000_500,
        };

        let json = serde_json::to_string(&metadata).unwrap();
        let back: BatchMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(back.batch_id, metadata.batch_id);
        assert_eq!(back.sequence_start, 100);
        assert_eq!(back.sequence_end, 199);
        assert_eq!(back.status, BatchStatus::Loaded);
        assert_eq!(back.created_at, metadata.created_at);
        assert_eq!(back.loaded_at, metadata.loaded_at);
    }

    #[test]
    fn unset_loaded_at_is_omitted_and_defaults_to_zero() {
        let metadata = BatchMetadata {
            batch_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            sequence_start: 0,
            sequence_end: 99,
            status: BatchStatus::Pending,
            created_at: 1,
            loaded_at: 0,
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("loaded_at"));

        let back: BatchMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.loaded_at, 0);
    }

    #[test]
    fn status_strings_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&BatchStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&BatchStatus::Loaded).unwrap(),
            "\"loaded\""
        );
        assert_eq!(
            serde_json::to_string(&BatchStatus::Acknowledged).unwrap(),
            "\"acknowledged\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Terminated).unwrap(),
            "\"terminated\""
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{
            "session_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "process_id": 42,
            "started_at": 1,
            "last_heartbeat": 2,
            "status": "active",
            "some_future_field": true
        }"#;

        let state: SessionState = serde_json::from_str(json).unwrap();
        assert_eq!(state.process_id, 42);
        assert_eq!(state.status, SessionStatus::Active);
    }
}
