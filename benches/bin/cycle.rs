use durastash::util::init_tracing;
use durastash::{make_rocksdb_store, GroupStore, GroupStoreConfig};
use std::time::Instant;

const PAYLOADS: usize = 100_000;
const BATCH_SIZE: usize = 500;

/// Full save -> load -> acknowledge cycle over one group.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = "test_data/bench_cycle";
    let _ = std::fs::remove_dir_all(path);

    let queue = GroupStore::new(
        make_rocksdb_store(path, false)?,
        GroupStoreConfig::default(),
    );
    queue.initialize_session("bench").await;
    queue.set_batch_size(BATCH_SIZE).await;

    let payload = vec![7u8; 512];

    let start = Instant::now();
    for _ in 0..PAYLOADS {
        queue.save("bench", &payload).await;
    }
    tracing::info!(
        "save/sec = {}",
        PAYLOADS as f64 / start.elapsed().as_secs_f64()
    );

    let start = Instant::now();
    let mut drained = 0usize;
    loop {
        let results = queue.load_batch("bench", 16).await;
        if results.is_empty() {
            break;
        }
        for batch in results {
            drained += batch.data.len();
            queue.acknowledge_batch("bench", &batch.batch_id).await;
        }
    }
    tracing::info!(
        "load+ack/sec = {}, drained = {}",
        drained as f64 / start.elapsed().as_secs_f64(),
        drained
    );

    queue.shutdown().await;
    Ok(())
}
