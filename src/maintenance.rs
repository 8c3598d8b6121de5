use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that rewrites a tenant's WAL once enough records have
/// accumulated since the last compaction. One per tenant, spawned when the
/// tenant's engine is created.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tick.tick().await;
        let pending = engine.wal_appends_since_compact().await;
        if pending < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted, folded {pending} records"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allot_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn append_counter_resets_after_compaction() {
        let engine = Arc::new(Engine::new(test_wal_path("compact_counter.wal")).unwrap());

        engine
            .create_resource(Ulid::new(), None, ResourceKind::Exclusive, 1, None)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await >= 1);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
