//! One-way projection of the registry into the `repos` table.
//!
//! The registry is the source of truth. Syncing upserts registry columns only,
//! so cached status and README columns survive description or tag edits, and
//! rows for ids that left the registry are deleted together with their README
//! index. Everything happens in one transaction.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::models::DbRepoRow;
use crate::registry::{Registry, RegistryEntry};
use crate::search;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorSummary {
    pub upserted: usize,
    pub removed: Vec<String>,
}

pub async fn sync_registry(pool: &SqlitePool, registry: &Registry) -> Result<MirrorSummary> {
    let mut tx = pool.begin().await?;

    for entry in &registry.repos {
        upsert_entry(&mut *tx, entry).await?;
    }

    let wanted: HashSet<&str> = registry.repos.iter().map(|e| e.id.as_str()).collect();
    let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM repos ORDER BY id")
        .fetch_all(&mut *tx)
        .await?;

    let mut removed = Vec::new();
    for id in existing {
        if wanted.contains(id.as_str()) {
            continue;
        }
        search::delete_repo_chunks(&mut *tx, &id).await?;
        sqlx::query("DELETE FROM repos WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        removed.push(id);
    }

    tx.commit().await?;

    tracing::debug!(
        upserted = registry.repos.len(),
        removed = removed.len(),
        "mirrored registry into database"
    );
    Ok(MirrorSummary {
        upserted: registry.repos.len(),
        removed,
    })
}

async fn upsert_entry(conn: &mut sqlx::SqliteConnection, entry: &RegistryEntry) -> Result<()> {
    let tags_json = serde_json::to_string(&entry.tags)?;
    sqlx::query(
        r#"
        INSERT INTO repos (id, host, owner, repo, clone_url, description, tags_json,
                           default_remote_name, update_strategy, submodules, lfs,
                           source, starred_at, managed)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            host = excluded.host,
            owner = excluded.owner,
            repo = excluded.repo,
            clone_url = excluded.clone_url,
            description = excluded.description,
            tags_json = excluded.tags_json,
            default_remote_name = excluded.default_remote_name,
            update_strategy = excluded.update_strategy,
            submodules = excluded.submodules,
            lfs = excluded.lfs,
            source = excluded.source,
            starred_at = excluded.starred_at,
            managed = excluded.managed
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.host)
    .bind(&entry.owner)
    .bind(&entry.repo)
    .bind(&entry.clone_url)
    .bind(&entry.description)
    .bind(&tags_json)
    .bind(&entry.default_remote_name)
    .bind(entry.update_strategy.to_string())
    .bind(entry.submodules.to_string())
    .bind(entry.lfs.to_string())
    .bind(entry.source.to_string())
    .bind(&entry.starred_at)
    .bind(entry.managed)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record what was observed on disk. A missing checkout has no dirty state;
/// `dirty = None` on an existing one keeps the previous value.
pub async fn update_status(
    pool: &SqlitePool,
    id: &str,
    exists: bool,
    dirty: Option<bool>,
    checked_at: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE repos SET
            status_exists = ?,
            status_is_dirty = CASE WHEN ? THEN COALESCE(?, status_is_dirty) ELSE NULL END,
            status_checked_at = ?
        WHERE id = ?
        "#,
    )
    .bind(exists)
    .bind(exists)
    .bind(dirty)
    .bind(checked_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_readme_hash(
    pool: &SqlitePool,
    id: &str,
    content_hash: Option<&str>,
    indexed_at: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE repos SET content_hash = ?, readme_indexed_at = ? WHERE id = ?")
        .bind(content_hash)
        .bind(indexed_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

const SELECT_ROW: &str = r#"
    SELECT id, host, owner, repo, clone_url, description, tags_json,
           default_remote_name, update_strategy, submodules, lfs, source,
           starred_at, managed, content_hash, readme_indexed_at,
           status_exists, status_is_dirty, status_checked_at
    FROM repos
"#;

fn row_to_model(row: &SqliteRow) -> DbRepoRow {
    let tags_json: String = row.get("tags_json");
    DbRepoRow {
        id: row.get("id"),
        host: row.get("host"),
        owner: row.get("owner"),
        repo: row.get("repo"),
        clone_url: row.get("clone_url"),
        description: row.get("description"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        default_remote_name: row.get("default_remote_name"),
        update_strategy: row.get("update_strategy"),
        submodules: row.get("submodules"),
        lfs: row.get("lfs"),
        source: row.get("source"),
        starred_at: row.get("starred_at"),
        managed: row.get("managed"),
        content_hash: row.get("content_hash"),
        readme_indexed_at: row.get("readme_indexed_at"),
        status_exists: row.get("status_exists"),
        status_is_dirty: row.get("status_is_dirty"),
        status_checked_at: row.get("status_checked_at"),
    }
}

pub async fn list_repos(pool: &SqlitePool) -> Result<Vec<DbRepoRow>> {
    let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_ROW))
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_model).collect())
}

pub async fn get_repo(pool: &SqlitePool, id: &str) -> Result<Option<DbRepoRow>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ROW))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_model))
}

/// Delete one row and its README index. Returns whether a row existed.
pub async fn delete_repo(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    search::delete_repo_chunks(&mut *tx, id).await?;
    let result = sqlx::query("DELETE FROM repos WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntrySource;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn test_pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect(&tmp.path().join("clones.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn registry(urls: &[&str]) -> Registry {
        let mut reg = Registry::default();
        for url in urls {
            reg.upsert(RegistryEntry::from_clone_url(url, EntrySource::Manual, true).unwrap());
        }
        reg
    }

    #[tokio::test]
    async fn mirror_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let reg = registry(&["https://github.com/acme/widgets", "git@gitlab.com:team/tool.git"]);

        let first = sync_registry(&pool, &reg).await.unwrap();
        let rows_first = list_repos(&pool).await.unwrap();
        let second = sync_registry(&pool, &reg).await.unwrap();
        let rows_second = list_repos(&pool).await.unwrap();

        assert_eq!(first.upserted, 2);
        assert!(second.removed.is_empty());
        assert_eq!(rows_first, rows_second);
        assert_eq!(rows_first[0].id, "github.com:acme/widgets");
        assert_eq!(rows_first[0].update_strategy, "hard-reset");
    }

    #[tokio::test]
    async fn registry_update_preserves_cached_columns() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let mut reg = registry(&["https://github.com/acme/widgets"]);
        let id = "github.com:acme/widgets";

        sync_registry(&pool, &reg).await.unwrap();
        update_status(&pool, id, true, Some(true), "2024-05-01T00:00:00.000Z")
            .await
            .unwrap();
        set_readme_hash(&pool, id, Some("abc"), Some("2024-05-01T00:00:00.000Z"))
            .await
            .unwrap();

        reg.get_mut(id).unwrap().description = Some("Widgets!".to_string());
        sync_registry(&pool, &reg).await.unwrap();

        let row = get_repo(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.description.as_deref(), Some("Widgets!"));
        assert_eq!(row.status_exists, Some(true));
        assert_eq!(row.status_is_dirty, Some(true));
        assert_eq!(row.status_checked_at.as_deref(), Some("2024-05-01T00:00:00.000Z"));
        assert_eq!(row.content_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn status_update_rules() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let id = "github.com:acme/widgets";
        sync_registry(&pool, &registry(&["https://github.com/acme/widgets"]))
            .await
            .unwrap();

        update_status(&pool, id, true, Some(false), "t1").await.unwrap();
        update_status(&pool, id, true, None, "t2").await.unwrap();
        let row = get_repo(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.status_is_dirty, Some(false));
        assert_eq!(row.status_checked_at.as_deref(), Some("t2"));

        update_status(&pool, id, false, None, "t3").await.unwrap();
        let row = get_repo(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.status_exists, Some(false));
        assert_eq!(row.status_is_dirty, None);
    }

    #[tokio::test]
    async fn empty_registry_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let reg = registry(&["https://github.com/acme/widgets", "https://github.com/acme/gears"]);
        sync_registry(&pool, &reg).await.unwrap();
        search::index_readme(&pool, "github.com:acme/gears", "h", &["gears readme".to_string()])
            .await
            .unwrap();

        let summary = sync_registry(&pool, &Registry::default()).await.unwrap();
        assert_eq!(summary.removed.len(), 2);
        assert!(list_repos(&pool).await.unwrap().is_empty());
        assert_eq!(search::chunk_count(&pool, None).await.unwrap(), 0);
        assert!(search::rank_repos_by_query(&pool, "gears", 10).await.is_empty());
    }

    #[tokio::test]
    async fn delete_single_repo() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        sync_registry(&pool, &registry(&["https://github.com/acme/widgets"]))
            .await
            .unwrap();
        assert!(delete_repo(&pool, "github.com:acme/widgets").await.unwrap());
        assert!(!delete_repo(&pool, "github.com:acme/widgets").await.unwrap());
    }
}
