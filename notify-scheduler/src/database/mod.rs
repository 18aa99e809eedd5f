//! Persistence layer.
//!
//! SQLite through sqlx: pool setup, embedded migrations, models, repositories
//! and periodic maintenance. The pool is shared by the queue, the scheduler
//! and the metrics recorder.

pub mod maintenance;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

pub use maintenance::{MaintenanceConfig, MaintenanceReport, MaintenanceScheduler};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

const MAX_POOL_SIZE: u32 = 10;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool size for file databases: two connections per core, at most 10.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism().map_or(2, |n| n.get() as u32);
    (cores * 2).min(MAX_POOL_SIZE)
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Open a WAL-mode pool with at most `max_connections` connections.
///
/// An in-memory database lives only as long as its connection, so its
/// connections are never reaped, and callers should pass `max_connections = 1`.
pub async fn init_pool_with_size(database_url: &str, max_connections: u32) -> crate::Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        // 16 MiB page cache per connection (negative values are KiB).
        .pragma("cache_size", "-16384")
        .pragma("temp_store", "MEMORY")
        .pragma("wal_autocheckpoint", "1000")
        .pragma("journal_size_limit", "67108864");

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT);
    if is_in_memory(database_url) {
        pool_options = pool_options
            .min_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;
    info!(max_connections, "Database pool ready");
    Ok(pool)
}

/// [`init_pool_with_size`] with [`default_pool_size`].
pub async fn init_pool(database_url: &str) -> crate::Result<DbPool> {
    init_pool_with_size(database_url, default_pool_size()).await
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database schema up to date");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
