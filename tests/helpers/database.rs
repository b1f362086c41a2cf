#![allow(dead_code)]

use std::sync::Arc;

use conduit::adapters::sqlite::{
    create_migrated_test_pool, database_url, initialize_database, PoolConfig, SqliteTaskRepository,
};
use conduit::domain::models::{ClaimStrategyKind, QueueConfig};
use conduit::services::{TaskQueue, WorkSignal};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Create an in-memory SQLite database for testing
///
/// Each call creates a completely isolated, migrated database instance.
pub async fn setup_test_db() -> SqlitePool {
    create_migrated_test_pool()
        .await
        .expect("failed to create test database")
}

/// Create a file-backed database that several connections can share.
///
/// Keep the returned `TempDir` alive for as long as the pool is used.
pub async fn setup_file_db(max_connections: u32) -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("conduit.db");
    let config = PoolConfig {
        max_connections,
        ..PoolConfig::default()
    };
    let pool = initialize_database(&database_url(&path.to_string_lossy()), Some(config))
        .await
        .expect("failed to create file database");
    (dir, pool)
}

/// Queue over `pool` with the given claim strategy.
pub fn queue_with(pool: SqlitePool, strategy: ClaimStrategyKind) -> Arc<TaskQueue> {
    Arc::new(TaskQueue::new(
        Arc::new(SqliteTaskRepository::with_claim_strategy(pool, strategy)),
        WorkSignal::new(),
        QueueConfig {
            claim_strategy: strategy,
            ..QueueConfig::default()
        },
    ))
}

/// Teardown test database
pub async fn teardown_test_db(pool: SqlitePool) {
    pool.close().await;
}
