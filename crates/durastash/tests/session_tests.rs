use std::sync::Arc;
use std::time::Duration;

use durastash::util::id;
use durastash::{
    make_memory_store, SessionManager, SessionState, SessionStatus, Storage,
};

fn make_manager() -> (Arc<SessionManager>, Arc<dyn Storage>) {
    let storage: Arc<dyn Storage> = Arc::new(make_memory_store());
    (
        Arc::new(SessionManager::new(Arc::clone(&storage))),
        storage,
    )
}

async fn read_state(storage: &Arc<dyn Storage>, group: &str, session_id: &str) -> SessionState {
    let raw = storage
        .get(&format!("{group}:{session_id}:state"))
        .await
        .unwrap()
        .expect("session state record");
    serde_json::from_slice(&raw).expect("parseable session state")
}

#[tokio::test]
async fn initialize_writes_an_active_record() -> anyhow::Result<()> {
    let (manager, storage) = make_manager();

    let session_id = manager.initialize_session("g").await?;
    assert!(id::is_valid(&session_id));
    assert_eq!(manager.session_id().await.as_deref(), Some(&session_id[..]));

    let state = read_state(&storage, "g", &session_id).await;
    assert_eq!(state.session_id, session_id);
    assert_eq!(state.status, SessionStatus::Active);
    assert_eq!(state.process_id, std::process::id() as i64);
    assert!(state.started_at > 0);
    assert_eq!(state.last_heartbeat, state.started_at);
    Ok(())
}

#[tokio::test]
async fn initialize_replaces_the_held_identity() -> anyhow::Result<()> {
    let (manager, _storage) = make_manager();

    let first = manager.initialize_session("g").await?;
    let second = manager.initialize_session("g").await?;
    assert_ne!(first, second);
    assert_eq!(manager.session_id().await.as_deref(), Some(&second[..]));

    // both records exist; only the held identity changed
    assert!(manager.is_session_active("g", &first).await);
    assert!(manager.is_session_active("g", &second).await);
    Ok(())
}

#[tokio::test]
async fn terminate_flips_status_and_is_idempotent() -> anyhow::Result<()> {
    let (manager, storage) = make_manager();

    let session_id = manager.initialize_session("g").await?;
    manager.terminate_session("g", &session_id).await?;

    let state = read_state(&storage, "g", &session_id).await;
    assert_eq!(state.status, SessionStatus::Terminated);
    assert!(!manager.is_session_active("g", &session_id).await);
    assert_eq!(manager.session_id().await, None);

    // second call is a no-op, record included
    manager.terminate_session("g", &session_id).await?;
    let again = read_state(&storage, "g", &session_id).await;
    assert_eq!(again.status, SessionStatus::Terminated);
    Ok(())
}

#[tokio::test]
async fn terminate_of_absent_record_is_a_no_op() -> anyhow::Result<()> {
    let (manager, _storage) = make_manager();
    manager
        .terminate_session("g", "01ARZ3NDEKTSV4RRFFQ69G5FAV")
        .await?;
    Ok(())
}

#[tokio::test]
async fn heartbeat_updates_the_record() -> anyhow::Result<()> {
    let (manager, storage) = make_manager();

    let session_id = manager.initialize_session("g").await?;
    let before = read_state(&storage, "g", &session_id).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(manager.update_heartbeat("g").await);

    let after = read_state(&storage, "g", &session_id).await;
    assert!(after.last_heartbeat >= before.last_heartbeat);
    assert_eq!(after.status, SessionStatus::Active);
    Ok(())
}

#[tokio::test]
async fn heartbeat_without_a_session_is_false() {
    let (manager, _storage) = make_manager();
    assert!(!manager.update_heartbeat("g").await);
}

#[tokio::test]
async fn is_session_active_on_missing_record_is_false() {
    let (manager, _storage) = make_manager();
    assert!(
        !manager
            .is_session_active("g", "01ARZ3NDEKTSV4RRFFQ69G5FAV")
            .await
    );
}

#[tokio::test]
async fn cleanup_reclaims_only_stale_active_sessions() -> anyhow::Result<()> {
    let (manager, storage) = make_manager();

    // two sessions in the group: one terminated, one stale-active
    let old = manager.initialize_session("g").await?;
    manager.terminate_session("g", &old).await?;
    let stale = manager.initialize_session("g").await?;

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(manager.cleanup_timeout_sessions("g", 0).await?, 1);
    let state = read_state(&storage, "g", &stale).await;
    assert_eq!(state.status, SessionStatus::Terminated);

    // nothing active remains
    assert_eq!(manager.cleanup_timeout_sessions("g", 0).await?, 0);
    Ok(())
}

#[tokio::test]
async fn cleanup_spares_sessions_within_the_timeout() -> anyhow::Result<()> {
    let (manager, _storage) = make_manager();

    let session_id = manager.initialize_session("g").await?;
    assert_eq!(manager.cleanup_timeout_sessions("g", 60_000).await?, 0);
    assert!(manager.is_session_active("g", &session_id).await);
    Ok(())
}

#[tokio::test]
async fn heartbeat_worker_keeps_the_record_fresh() -> anyhow::Result<()> {
    let (manager, storage) = make_manager();

    let session_id = manager.initialize_session("g").await?;
    let before = read_state(&storage, "g", &session_id).await;

    manager.start_heartbeat(10).await;
    // starting twice is fine
    manager.start_heartbeat(10).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = read_state(&storage, "g", &session_id).await;
    assert!(
        after.last_heartbeat > before.last_heartbeat,
        "worker never heartbeat: {} vs {}",
        after.last_heartbeat,
        before.last_heartbeat
    );

    manager.stop_heartbeat().await;
    // stopping twice is fine
    manager.stop_heartbeat().await;

    // worker is gone; the record stops moving
    let frozen = read_state(&storage, "g", &session_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let still = read_state(&storage, "g", &session_id).await;
    assert_eq!(still.last_heartbeat, frozen.last_heartbeat);
    Ok(())
}
