use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

/// Background task that compacts a tenant's WAL once enough frames have
/// piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // First tick fires immediately; nothing to compact yet.
    interval.tick().await;
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            debug!("compactor pass done");
        }
    }
}

/// Compact when at least `threshold` frames were appended. Returns whether
/// a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}
