//! DuraStash: an embedded, durable, grouped FIFO queue on an ordered
//! key-value store.
//!
//! Producers [`GroupStore::save`] opaque payloads into named groups;
//! consumers drain them with [`GroupStore::load_batch`] and confirm with
//! [`GroupStore::acknowledge_batch`] (or hand back the unprocessed tail via
//! [`GroupStore::resave_batch`]). Everything a process writes is namespaced
//! by a per-process session identity, so restarts never collide.
//!
//! ```no_run
//! use durastash::{make_rocksdb_store, GroupStore, GroupStoreConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = GroupStore::new(
//!     make_rocksdb_store("./stash_db", true)?,
//!     GroupStoreConfig::default(),
//! );
//!
//! store.save("events", b"payload").await;
//! for batch in store.load_batch("events", 10).await {
//!     // ... process batch.data ...
//!     store.acknowledge_batch("events", &batch.batch_id).await;
//! }
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use durastash_queue::batch::BatchManager;
pub use durastash_queue::session::SessionManager;
pub use durastash_queue::types::{BatchMetadata, BatchStatus, SessionState, SessionStatus};
pub use durastash_queue::{BatchLoadResult, GroupStore, GroupStoreConfig, StashError};
pub use durastash_storage::{
    make_memory_store, make_rocksdb_store, Storage, StorageError,
};
pub use durastash_util as util;
