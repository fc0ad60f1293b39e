use durastash::util::init_tracing;
use durastash::{make_rocksdb_store, GroupStore, GroupStoreConfig};
use std::time::Instant;

const ITERATIONS: usize = 200_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    run_bench(256).await?;
    run_bench(1024).await?;
    run_bench(4096).await?;

    Ok(())
}

async fn run_bench(max_payload_size: usize) -> anyhow::Result<()> {
    let payloads = (0..ITERATIONS)
        .map(|_| {
            let size = fastrand::usize(32..max_payload_size);
            let mut buf = vec![0u8; size];
            fastrand::fill(&mut buf);
            buf
        })
        .collect::<Vec<_>>();

    // First delete any existing bench DB
    let path = format!("test_data/bench_save_{max_payload_size}");
    let _ = std::fs::remove_dir_all(&path);

    let queue = GroupStore::new(
        make_rocksdb_store(&path, false)?,
        GroupStoreConfig::default(),
    );
    queue.initialize_session("bench").await;

    let start = Instant::now();

    for buf in &payloads {
        queue.save("bench", buf).await;
    }

    tracing::info!(
        "save/sec = {}, max payload size = {} bytes",
        ITERATIONS as f64 / start.elapsed().as_secs_f64(),
        max_payload_size
    );

    queue.shutdown().await;
    Ok(())
}
