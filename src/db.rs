//! SQLite connection handling.
//!
//! One pool per command invocation. [`with_db`] is the only way commands
//! obtain it, so the schema is always current and the pool is closed on
//! every exit path.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;

use crate::migrate;

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open the database, run migrations, hand the pool to `f`, and close the
/// pool whether or not `f` succeeded.
pub async fn with_db<T, F, Fut>(db_path: &Path, f: F) -> Result<T>
where
    F: FnOnce(SqlitePool) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let pool = connect(db_path).await?;
    let result = match migrate::run_migrations(&pool).await {
        Ok(()) => f(pool.clone()).await,
        Err(e) => Err(e),
    };
    pool.close().await;
    result
}
