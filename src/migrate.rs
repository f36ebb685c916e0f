use anyhow::Result;
use sqlx::SqlitePool;

use crate::search;

/// Idempotent schema setup for the repository mirror and the README index.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Registry mirror plus derived/cached columns
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repos (
            id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            owner TEXT NOT NULL,
            repo TEXT NOT NULL,
            clone_url TEXT NOT NULL,
            description TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            default_remote_name TEXT NOT NULL DEFAULT 'origin',
            update_strategy TEXT NOT NULL DEFAULT 'hard-reset',
            submodules TEXT NOT NULL DEFAULT 'none',
            lfs TEXT NOT NULL DEFAULT 'auto',
            source TEXT NOT NULL DEFAULT 'manual',
            starred_at TEXT,
            managed INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT,
            readme_indexed_at TEXT,
            status_exists INTEGER,
            status_is_dirty INTEGER,
            status_checked_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_repos_owner_repo ON repos(owner, repo)")
        .execute(pool)
        .await?;

    search::ensure_search_tables(pool).await?;

    Ok(())
}
